//! Final metrics collection for a finished training run.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};
use spektra_core::job::Hyperparams;

/// Per-epoch results table written by the routine into its run directory.
pub const RESULTS_FILE: &str = "results.csv";

/// Routine result keys and the names they are stored under.
const METRIC_ALIASES: [(&str, &str); 4] = [
    ("metrics/mAP50(B)", "mAP50"),
    ("metrics/mAP50-95(B)", "mAP50_95"),
    ("metrics/precision(B)", "precision"),
    ("metrics/recall(B)", "recall"),
];

/// Column prefix of training loss terms in the results table.
const TRAIN_LOSS_PREFIX: &str = "train/";

/// Build the metrics object stored on a completed training job.
///
/// Known result keys are renamed, other numeric keys are kept verbatim,
/// the hyperparameters are recorded and the final-epoch loss terms are
/// read from `results.csv` when the run directory has one.
pub fn collect_train_metrics(
    reported: &BTreeMap<String, f64>,
    hyperparams: &Hyperparams,
    save_dir: Option<&Path>,
) -> Value {
    let mut out = Map::new();

    for (key, value) in reported {
        let name = METRIC_ALIASES
            .iter()
            .find(|(from, _)| from == key)
            .map_or(key.as_str(), |(_, to)| to);
        insert_number(&mut out, name, *value);
    }

    out.insert("epochs".into(), hyperparams.epochs.into());
    out.insert("imgsz".into(), hyperparams.image_size.into());
    out.insert("batch".into(), hyperparams.batch.into());

    if let Some(dir) = save_dir {
        match std::fs::read_to_string(dir.join(RESULTS_FILE)) {
            Ok(csv) => {
                for (name, value) in final_losses(&csv) {
                    insert_number(&mut out, &name, value);
                }
            }
            Err(e) => tracing::debug!(dir = %dir.display(), error = %e, "No results table"),
        }
    }

    Value::Object(out)
}

/// Loss columns of the last data row, keyed without the `train/` prefix.
pub fn final_losses(csv: &str) -> BTreeMap<String, f64> {
    let mut lines = csv.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return BTreeMap::new();
    };
    let Some(last) = lines.last() else {
        return BTreeMap::new();
    };

    header
        .split(',')
        .map(str::trim)
        .zip(last.split(',').map(str::trim))
        .filter_map(|(column, raw)| {
            let name = column.strip_prefix(TRAIN_LOSS_PREFIX)?;
            let value = raw.parse::<f64>().ok()?;
            Some((name.to_string(), value))
        })
        .collect()
}

/// Non-finite values have no JSON representation and are dropped.
fn insert_number(out: &mut Map<String, Value>, key: &str, value: f64) {
    if let Some(number) = serde_json::Number::from_f64(value) {
        out.insert(key.to_string(), Value::Number(number));
    }
}
