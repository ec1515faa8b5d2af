//! Fixed catalog of supported model architectures.

use serde::Serialize;

/// Display metadata for one trainable architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelArchitecture {
    /// Weights file name understood by the training routine.
    pub key: &'static str,
    pub name: &'static str,
    pub size: &'static str,
    /// Parameter count, human readable.
    pub params: &'static str,
}

/// Architecture used when a train request does not name one.
pub const DEFAULT_ARCHITECTURE: &str = "yolo11n.pt";

pub const MODEL_ARCHITECTURES: &[ModelArchitecture] = &[
    ModelArchitecture { key: "yolo11n.pt", name: "YOLO11 Nano", size: "nano", params: "2.6M" },
    ModelArchitecture { key: "yolo11s.pt", name: "YOLO11 Small", size: "small", params: "9.4M" },
    ModelArchitecture { key: "yolo11m.pt", name: "YOLO11 Medium", size: "medium", params: "20.1M" },
    ModelArchitecture { key: "yolo11l.pt", name: "YOLO11 Large", size: "large", params: "25.3M" },
    ModelArchitecture { key: "yolo11x.pt", name: "YOLO11 XLarge", size: "xlarge", params: "56.9M" },
    ModelArchitecture { key: "yolov8n.pt", name: "YOLOv8 Nano", size: "nano", params: "3.2M" },
    ModelArchitecture { key: "yolov8s.pt", name: "YOLOv8 Small", size: "small", params: "11.2M" },
    ModelArchitecture { key: "yolov8m.pt", name: "YOLOv8 Medium", size: "medium", params: "25.9M" },
];

/// Look up an architecture by key.
pub fn find_architecture(key: &str) -> Option<&'static ModelArchitecture> {
    MODEL_ARCHITECTURES.iter().find(|a| a.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_architecture_is_in_catalog() {
        assert!(find_architecture(DEFAULT_ARCHITECTURE).is_some());
    }

    #[test]
    fn unknown_architecture_is_rejected() {
        assert!(find_architecture("resnet50.pt").is_none());
    }

    #[test]
    fn catalog_keys_are_unique() {
        for (i, a) in MODEL_ARCHITECTURES.iter().enumerate() {
            assert!(
                MODEL_ARCHITECTURES[i + 1..].iter().all(|b| b.key != a.key),
                "duplicate key {}",
                a.key
            );
        }
    }
}
