#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

pub const ENTITIES: usize = 40;
pub const PERIODS: usize = 8;

/// Writes a performance and an origination table into `dir`.
///
/// Statuses cycle 0 -> 1 -> 2 with three irregular cells: one `RA` sentinel,
/// one blank, and one rare code 7. Scores alternate around the 700 cutoff.
/// `E005` has two origination rows and `X999` has none.
pub fn write_tables(dir: &Path) -> (PathBuf, PathBuf) {
    let mut perf = String::from("id,period,status,upb\n");
    for e in 0..ENTITIES {
        for t in 0..PERIODS {
            let status = match (e, t) {
                (0, 7) => "RA".to_string(),
                (1, 3) => String::new(),
                (2, 5) => "7".to_string(),
                _ => ((e + t) % 3).to_string(),
            };
            let upb = 1000.0 - 10.0 * t as f64 + e as f64;
            perf.push_str(&format!("E{e:03},{},{status},{upb}\n", 202001 + t));
        }
    }
    perf.push_str("X999,202001,0,500\n");

    let mut orig = String::from("id,score\n");
    for e in 0..ENTITIES {
        orig.push_str(&format!("E{e:03},{}\n", 650 + (e % 4) * 40));
    }
    orig.push_str("E005,800\n");

    let perf_path = dir.join("performance.csv");
    let orig_path = dir.join("origination.csv");
    fs::write(&perf_path, perf).unwrap();
    fs::write(&orig_path, orig).unwrap();
    (perf_path, orig_path)
}

/// Configuration matching the tables from [`write_tables`], with a small
/// classifier so the runs stay fast.
pub const CONFIG_TOML: &str = r#"
include_covariates = true

[input.columns]
entity_id = "id"
period = "period"
status = "status"
tier_covariate = "score"
covariates = ["upb"]

[reclassify]
threshold = 0.997

[classifier]
hidden_layer_sizes = [6]
learning_rate_init = 0.05
batch_size = 32
max_iter = 40
"#;

pub fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("delinq.toml");
    fs::write(&path, CONFIG_TOML).unwrap();
    path
}
