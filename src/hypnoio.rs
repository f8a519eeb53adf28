//! Hypnogram file formats.
//!
//! Two representations exist on disk. The "sample" version stores one
//! integer per hypnogram sample (`.txt` with a `_description.txt` companion,
//! or Elan `.hyp`). The "time" version stores `(stage, end_time)` rows
//! (`.txt`, `.csv`, `.xlsx`) and is the only one that can carry a custom
//! stage dictionary.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use calamine::{Data, Reader, Xlsx, open_workbook};
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SleepError};
use crate::recording::extension;
use crate::stages::StageDict;

const ELAN_REM: i32 = 5;
const ELAN_N4: i32 = 4;
const XLSX_SHEET: &str = "Data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypnoVersion {
    Sample,
    Time,
}

/// A hypnogram read from disk, already aligned to the signal timebase.
#[derive(Debug, Clone, PartialEq)]
pub struct HypnoFile {
    pub version: HypnoVersion,
    pub values: Vec<i32>,
    /// Sampling rate of the file itself (1 / sampling period) for "sample" files.
    pub sf_hyp: Option<f64>,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub version: HypnoVersion,
    /// Seconds represented by one written value in "sample" files.
    pub window_s: f64,
    pub metadata: Vec<(String, String)>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            version: HypnoVersion::Time,
            window_s: 1.0,
            metadata: Vec::new(),
        }
    }
}

fn time_step(time: &[f64]) -> f64 {
    match time {
        [a, b, ..] if b > a => b - a,
        _ => 1.0,
    }
}

/// Collapses a per-sample vector into `(stage_name, end_time)` runs.
pub fn sample_to_time(hypno: &[i32], time: &[f64], stages: &StageDict) -> Result<Vec<(String, f64)>> {
    if hypno.len() != time.len() {
        return Err(SleepError::InvalidArgument(format!(
            "hypnogram has {} samples but time vector has {}",
            hypno.len(),
            time.len()
        )));
    }
    let Some(&last_time) = time.last() else {
        return Ok(Vec::new());
    };
    let end_of_data = last_time + time_step(time);
    let mut rows = Vec::new();
    let mut start = 0;
    while start < hypno.len() {
        let code = hypno[start];
        let end = hypno[start..]
            .iter()
            .position(|&v| v != code)
            .map_or(hypno.len(), |p| start + p);
        let name = stages
            .name_of(code)
            .ok_or_else(|| SleepError::UnknownStage(code.to_string()))?;
        let end_time = time.get(end).copied().unwrap_or(end_of_data);
        rows.push((name.to_owned(), end_time));
        start = end;
    }
    Ok(rows)
}

/// Expands `(stage_name, end_time)` rows onto `time`; each row covers
/// `[previous end, end)`. Samples past the last row keep the last stage.
pub fn time_to_sample(rows: &[(String, f64)], time: &[f64], stages: &StageDict) -> Result<Vec<i32>> {
    let half = time_step(time) / 2.0;
    let mut out = Vec::with_capacity(time.len());
    let mut j = 0;
    let mut last = None;
    for (name, end) in rows {
        let code = stages
            .value_of(name)
            .ok_or_else(|| SleepError::UnknownStage(name.clone()))?;
        while j < time.len() && time[j] < end - half {
            out.push(code);
            j += 1;
        }
        last = Some(code);
    }
    if let Some(code) = last {
        out.resize(time.len(), code);
    }
    Ok(out)
}

/// Same as [`time_to_sample`] on a regular timebase of `n` samples at `sf`.
pub fn time_to_sample_n(rows: &[(String, f64)], n: usize, sf: f64, stages: &StageDict) -> Result<Vec<i32>> {
    time_to_sample(rows, &crate::time_vector(n, sf), stages)
}

/// Upsamples by integer repetition, then pads with the last value to exactly `n`.
pub fn oversample(hypno: &[i32], n: usize) -> Vec<i32> {
    let Some(&last) = hypno.last() else {
        return Vec::new();
    };
    let rep = n / hypno.len();
    if rep == 0 {
        return (0..n).map(|i| hypno[i * hypno.len() / n]).collect();
    }
    let mut out: Vec<i32> = hypno
        .iter()
        .flat_map(|&v| std::iter::repeat_n(v, rep))
        .collect();
    out.resize(n, last);
    out
}

fn elan_to_storage(v: i32) -> i32 {
    match v {
        ELAN_REM => 4,
        ELAN_N4 => 3,
        other => other,
    }
}

fn storage_to_elan(v: i32) -> i32 {
    if v == 4 { ELAN_REM } else { v }
}

fn legacy_alias(name: &str) -> &str {
    match name {
        "Nde" | "Mt" | "nde" | "mt" => "Art",
        "N4" | "n4" => "N3",
        other => other,
    }
}

pub fn description_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}_description.txt"))
}

/// Reads a hypnogram and aligns it to `time`.
pub fn read_hypno(path: impl AsRef<Path>, stages: &StageDict, time: &[f64]) -> Result<HypnoFile> {
    let path = path.as_ref();
    let mut file = match extension(path).as_str() {
        "hyp" => read_elan_hyp(path, stages)?,
        "txt" if description_path(path).exists() => read_txt_sample(path, stages)?,
        ext => finish_time_version(path, time_records(path, ext)?, stages, time)?,
    };
    if file.values.len() != time.len() {
        log::debug!(
            "{}: oversampling {} hypnogram values to {}",
            path.display(),
            file.values.len(),
            time.len()
        );
        file.values = oversample(&file.values, time.len());
    }
    log::info!("Hypnogram loaded from {} ({:?} version)", path.display(), file.version);
    Ok(file)
}

/// Reads a hypnogram at its own rate, without a recording to align to.
///
/// "Time" files are expanded on a 1 Hz grid ending at the last row.
pub fn read_hypno_native(path: impl AsRef<Path>, stages: &StageDict) -> Result<(HypnoFile, f64)> {
    let path = path.as_ref();
    let file = match extension(path).as_str() {
        "hyp" => read_elan_hyp(path, stages)?,
        "txt" if description_path(path).exists() => read_txt_sample(path, stages)?,
        ext => {
            let (rows, metadata) = split_rows(path, time_records(path, ext)?)?;
            let last_end = rows.last().map_or(0.0, |(_, end)| *end);
            let n = last_end.round().max(0.0) as usize;
            HypnoFile {
                version: HypnoVersion::Time,
                values: time_to_sample_n(&rows, n, 1.0, stages)?,
                sf_hyp: Some(1.0),
                metadata,
            }
        }
    };
    let sf = file.sf_hyp.unwrap_or(1.0);
    Ok((file, sf))
}

fn time_records(path: &Path, ext: &str) -> Result<Vec<(String, String)>> {
    match ext {
        "txt" => txt_time_records(path),
        "csv" => csv_time_records(path),
        "xlsx" => xlsx_time_records(path),
        other => Err(SleepError::hypno(path, format!("unknown hypnogram extension '{other}'"))),
    }
}

fn read_elan_hyp(path: &Path, stages: &StageDict) -> Result<HypnoFile> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();
    let mut period = None;
    let mut epoch_nb = None;
    for line in lines.by_ref() {
        let line = line.trim();
        if line == "epoch_list" {
            break;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("sampling_period"), Some(v)) => period = v.parse::<f64>().ok(),
            (Some("epoch_nb"), Some(v)) => epoch_nb = v.parse::<usize>().ok(),
            _ => {}
        }
    }
    let period = period.filter(|p| *p > 0.0).ok_or_else(|| {
        SleepError::hypno(path, "missing or invalid sampling_period in Elan header")
    })?;
    let mut values = Vec::new();
    for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
        let raw: i32 = line
            .parse()
            .map_err(|_| SleepError::hypno(path, format!("'{line}' is not an integer")))?;
        let v = elan_to_storage(raw);
        if !stages.contains_value(v) {
            return Err(SleepError::UnknownStage(raw.to_string()));
        }
        values.push(v);
    }
    if let Some(n) = epoch_nb
        && n != values.len()
    {
        log::warn!(
            "{}: epoch_nb is {n} but {} values follow",
            path.display(),
            values.len()
        );
    }
    Ok(HypnoFile {
        version: HypnoVersion::Sample,
        values,
        sf_hyp: Some(1.0 / period),
        metadata: Vec::new(),
    })
}

fn read_txt_sample(path: &Path, stages: &StageDict) -> Result<HypnoFile> {
    let desc_path = description_path(path);
    let desc = fs::read_to_string(&desc_path)?;
    let mut period = None;
    let mut mapping = Vec::new();
    for line in desc.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            return Err(SleepError::hypno(&desc_path, format!("malformed line '{line}'")));
        };
        if key == "time" {
            period = value.parse::<f64>().ok();
            continue;
        }
        let file_value: i32 = value
            .parse()
            .map_err(|_| SleepError::hypno(&desc_path, format!("bad value in '{line}'")))?;
        let name = legacy_alias(key);
        let storage = stages
            .value_of(name)
            .ok_or_else(|| SleepError::UnknownStage(key.to_owned()))?;
        mapping.push((file_value, storage));
    }
    let period = period
        .filter(|p| *p > 0.0)
        .ok_or_else(|| SleepError::hypno(&desc_path, "missing 'time' line"))?;

    let text = fs::read_to_string(path)?;
    let mut values = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let raw: f64 = line
            .parse()
            .map_err(|_| SleepError::hypno(path, format!("'{line}' is not a number")))?;
        let raw = raw as i32;
        let v = mapping
            .iter()
            .find(|(file_value, _)| *file_value == raw)
            .map(|(_, storage)| *storage)
            .ok_or_else(|| SleepError::UnknownStage(raw.to_string()))?;
        values.push(v);
    }
    Ok(HypnoFile {
        version: HypnoVersion::Sample,
        values,
        sf_hyp: Some(1.0 / period),
        metadata: Vec::new(),
    })
}

/// Splits raw `(name, value)` records into metadata and stage rows.
fn split_rows(
    path: &Path,
    records: Vec<(String, String)>,
) -> Result<(Vec<(String, f64)>, Vec<(String, String)>)> {
    let mut rows = Vec::new();
    let mut metadata = Vec::new();
    for (name, value) in records {
        if let Some(key) = name.strip_prefix('*') {
            metadata.push((key.to_owned(), value));
            continue;
        }
        let end: f64 = match value.parse() {
            Ok(v) => v,
            // header row
            Err(_) if rows.is_empty() && name.eq_ignore_ascii_case("stage") => continue,
            Err(_) => {
                return Err(SleepError::hypno(path, format!("bad end time '{value}' for {name}")));
            }
        };
        rows.push((legacy_alias(&name).to_owned(), end));
    }
    if rows.is_empty() {
        return Err(SleepError::hypno(path, "no stage rows"));
    }
    Ok((rows, metadata))
}

fn split_fields(line: &str) -> Option<(String, String)> {
    let mut parts = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty());
    let name = parts.next()?.to_owned();
    let rest: Vec<&str> = parts.collect();
    Some((name, rest.join(" ")))
}

fn txt_time_records(path: &Path) -> Result<Vec<(String, String)>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(split_fields)
        .collect())
}

fn csv_time_records(path: &Path) -> Result<Vec<(String, String)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        let fields: Vec<&str> = record.iter().filter(|f| !f.is_empty()).collect();
        match fields.as_slice() {
            [] => {}
            [single] => records.extend(split_fields(single)),
            [name, rest @ ..] => records.push(((*name).to_owned(), rest.join(" "))),
        }
    }
    Ok(records)
}

fn xlsx_time_records(path: &Path) -> Result<Vec<(String, String)>> {
    let mut workbook: Xlsx<_> = open_workbook(path)?;
    let range = workbook.worksheet_range(XLSX_SHEET)?;
    let cell = |d: &Data| match d {
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Empty => String::new(),
        other => other.to_string(),
    };
    let records = range
        .rows()
        .filter(|row| !row.is_empty())
        .map(|row| {
            let name = row.first().map(cell).unwrap_or_default();
            let value = row.get(1).map(cell).unwrap_or_default();
            (name, value)
        })
        .filter(|(name, _)| !name.is_empty())
        .collect();
    Ok(records)
}

fn finish_time_version(
    path: &Path,
    records: Vec<(String, String)>,
    stages: &StageDict,
    time: &[f64],
) -> Result<HypnoFile> {
    let (rows, metadata) = split_rows(path, records)?;
    let values = time_to_sample(&rows, time, stages)?;
    Ok(HypnoFile {
        version: HypnoVersion::Time,
        values,
        sf_hyp: None,
        metadata,
    })
}

/// Writes `hypno` (storage codes aligned to `time`) to `path`.
pub fn write_hypno(
    path: impl AsRef<Path>,
    hypno: &[i32],
    time: &[f64],
    stages: &StageDict,
    options: &WriteOptions,
) -> Result<()> {
    let path = path.as_ref();
    let ext = extension(path);
    match (ext.as_str(), options.version) {
        ("hyp", _) => write_elan_hyp(path, hypno, time, stages, options.window_s)?,
        ("txt", HypnoVersion::Sample) => write_txt_sample(path, hypno, time, stages, options.window_s)?,
        ("txt", HypnoVersion::Time) => {
            let rows = sample_to_time(hypno, time, stages)?;
            write_txt_time(path, &rows, &options.metadata)?;
        }
        ("csv", _) => {
            let rows = sample_to_time(hypno, time, stages)?;
            write_csv_time(path, &rows, &options.metadata)?;
        }
        ("xlsx", _) => {
            let rows = sample_to_time(hypno, time, stages)?;
            write_xlsx_time(path, &rows, &options.metadata)?;
        }
        (other, _) => {
            return Err(SleepError::InvalidArgument(format!(
                "cannot write a hypnogram with extension '{other}'"
            )));
        }
    }
    log::info!("Hypnogram saved to {}", path.display());
    Ok(())
}

/// Values kept when writing one entry per `window_s` seconds: the first
/// sample of each window stands for the whole window.
fn subsample(hypno: &[i32], time: &[f64], window_s: f64) -> (Vec<i32>, f64) {
    let dt = time_step(time);
    let step = ((window_s / dt).round() as usize).max(1);
    let moved = hypno
        .iter()
        .enumerate()
        .filter(|&(i, v)| *v != hypno[i - i % step])
        .count();
    if moved > 0 {
        log::warn!("{moved} sample(s) change stage inside a {window_s} s window and are written as the window's first value");
    }
    let values = hypno.iter().step_by(step).copied().collect();
    (values, step as f64 * dt)
}

fn write_elan_hyp(path: &Path, hypno: &[i32], time: &[f64], stages: &StageDict, window_s: f64) -> Result<()> {
    if !stages.is_default() {
        return Err(SleepError::StateDictInvalid(vec![format!(
            "{}: Elan .hyp files only support the Art/Wake/N1/N2/N3/REM dictionary, use the time version",
            path.display()
        )]));
    }
    if let Some(bad) = hypno.iter().find(|v| !stages.contains_value(**v)) {
        return Err(SleepError::UnknownStage(bad.to_string()));
    }
    let (values, period) = subsample(hypno, time, window_s);
    let mut out = BufWriter::new(fs::File::create(path)?);
    writeln!(out, "time_base 1.000000")?;
    writeln!(out, "sampling_period {period}")?;
    writeln!(out, "epoch_nb {}", values.len())?;
    writeln!(out, "epoch_list")?;
    for v in values {
        writeln!(out, "{}", storage_to_elan(v))?;
    }
    out.flush()?;
    Ok(())
}

fn write_txt_sample(path: &Path, hypno: &[i32], time: &[f64], stages: &StageDict, window_s: f64) -> Result<()> {
    if let Some(bad) = hypno.iter().find(|v| !stages.contains_value(**v)) {
        return Err(SleepError::UnknownStage(bad.to_string()));
    }
    let (values, period) = subsample(hypno, time, window_s);
    let mut out = BufWriter::new(fs::File::create(path)?);
    for v in values {
        writeln!(out, "{v}")?;
    }
    out.flush()?;

    let mut desc = BufWriter::new(fs::File::create(description_path(path))?);
    writeln!(desc, "time {period}")?;
    for state in stages.states() {
        writeln!(desc, "{} {}", state.name, state.value)?;
    }
    desc.flush()?;
    Ok(())
}

fn write_txt_time(path: &Path, rows: &[(String, f64)], metadata: &[(String, String)]) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for (key, value) in metadata {
        writeln!(out, "*{key} {value}")?;
    }
    for (name, end) in rows {
        writeln!(out, "{name} {end}")?;
    }
    out.flush()?;
    Ok(())
}

fn write_csv_time(path: &Path, rows: &[(String, f64)], metadata: &[(String, String)]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    for (key, value) in metadata {
        writer.write_record([format!("*{key}"), value.clone()])?;
    }
    for (name, end) in rows {
        writer.write_record([name.clone(), end.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_xlsx_time(path: &Path, rows: &[(String, f64)], metadata: &[(String, String)]) -> Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(XLSX_SHEET)?;
    sheet.write_string(0, 0, "Stage")?;
    sheet.write_string(0, 1, "Time")?;
    let mut row = 1u32;
    for (key, value) in metadata {
        sheet.write_string(row, 0, format!("*{key}"))?;
        sheet.write_string(row, 1, value.as_str())?;
        row += 1;
    }
    for (name, end) in rows {
        sheet.write_string(row, 0, name.as_str())?;
        sheet.write_number(row, 1, *end)?;
        row += 1;
    }
    workbook.save(path)?;
    Ok(())
}
