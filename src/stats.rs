//! Sleep statistics derived from a hypnogram.

use std::path::Path;

use crate::error::Result;
use crate::stages::StageDict;

const SLEEP_STAGES: [&str; 4] = ["N1", "N2", "N3", "REM"];

/// Durations are in minutes, percentages of the sleep period time.
#[derive(Debug, Clone, PartialEq)]
pub struct SleepStats {
    rows: Vec<(String, f64)>,
}

fn minutes(samples: usize, sf: f64) -> f64 {
    samples as f64 / sf / 60.0
}

impl SleepStats {
    /// `sf` is the rate of `hypno`, in values per second.
    pub fn compute(hypno: &[i32], sf: f64, stages: &StageDict) -> Self {
        let code = |name: &str| stages.value_of(name);
        let sleep_codes: Vec<i32> = SLEEP_STAGES.iter().filter_map(|&n| code(n)).collect();
        let is_sleep = |v: &i32| sleep_codes.contains(v);

        let onset = hypno.iter().position(is_sleep);
        let last = hypno.iter().rposition(is_sleep);
        let spt_range = match (onset, last) {
            (Some(a), Some(b)) => a..b + 1,
            _ => 0..0,
        };
        let spt = &hypno[spt_range.clone()];
        let count = |slice: &[i32], name: &str| {
            code(name).map_or(0, |c| slice.iter().filter(|&&v| v == c).count())
        };
        let tst_samples = spt.iter().filter(|&v| is_sleep(v)).count();
        let spt_min = minutes(spt.len(), sf);
        let pct = |samples: usize| {
            if spt.is_empty() {
                0.0
            } else {
                100.0 * samples as f64 / spt.len() as f64
            }
        };

        let tib = minutes(hypno.len(), sf);
        let tst = minutes(tst_samples, sf);
        let mut rows = vec![
            ("TIB_min".to_owned(), tib),
            ("SOL_min".to_owned(), onset.map_or(tib, |o| minutes(o, sf))),
            ("SPT_min".to_owned(), spt_min),
            ("WASO_min".to_owned(), minutes(count(spt, "Wake"), sf)),
            ("TST_min".to_owned(), tst),
            ("SE_%".to_owned(), if tib > 0.0 { 100.0 * tst / tib } else { 0.0 }),
            ("Art_min".to_owned(), minutes(count(hypno, "Art"), sf)),
        ];
        for name in ["Wake", "N1", "N2", "N3", "REM"] {
            rows.push((format!("{name}_min"), minutes(count(hypno, name), sf)));
            rows.push((format!("{name}_%SPT"), pct(count(spt, name))));
        }
        for name in SLEEP_STAGES {
            let latency = code(name)
                .and_then(|c| hypno.iter().position(|&v| v == c))
                .map_or(f64::NAN, |p| minutes(p, sf));
            rows.push((format!("Lat_{name}_min"), latency));
        }
        Self { rows }
    }

    pub fn rows(&self) -> &[(String, f64)] {
        &self.rows
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.rows.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    /// `key,value` rows.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        writer.write_record(["key", "value"])?;
        for (key, value) in &self.rows {
            writer.write_record([key.clone(), format!("{value:.2}")])?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minute_epochs() {
        // one value per minute: 10 wake, 20 N2, 5 wake, 30 N3, 15 REM, 10 wake
        let mut h = vec![0; 10];
        h.extend([2; 20]);
        h.extend([0; 5]);
        h.extend([3; 30]);
        h.extend([4; 15]);
        h.extend([0; 10]);
        let stats = SleepStats::compute(&h, 1.0 / 60.0, &StageDict::default());
        let get = |k: &str| stats.get(k).unwrap();
        assert!((get("TIB_min") - 90.0).abs() < 1e-9);
        assert!((get("SOL_min") - 10.0).abs() < 1e-9);
        assert!((get("SPT_min") - 70.0).abs() < 1e-9);
        assert!((get("WASO_min") - 5.0).abs() < 1e-9);
        assert!((get("TST_min") - 65.0).abs() < 1e-9);
        assert!((get("N3_%SPT") - 300.0 / 7.0).abs() < 1e-9);
        assert!((get("Lat_REM_min") - 65.0).abs() < 1e-9);
        assert!(get("Lat_N1_min").is_nan());
    }

    #[test]
    fn all_wake() {
        let stats = SleepStats::compute(&[0; 30], 1.0, &StageDict::default());
        assert_eq!(stats.get("TST_min"), Some(0.0));
        assert_eq!(stats.get("SE_%"), Some(0.0));
        assert_eq!(stats.get("SOL_min"), Some(0.5));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        stats.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("key,value\nTIB_min,0.50\n"));
    }
}
