use crate::models::MasterRow;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ── Atomic file replacement ───────────────────────────────────────────────────

/// Replace `path` with `bytes` via a sibling temp file and a rename, so
/// readers never observe a half-written file.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, bytes).with_context(|| format!("Failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", tmp))?;
    Ok(())
}

// ── CSV codec ─────────────────────────────────────────────────────────────────

/// Header: `city,date,tmax_f,tmin_f,energy_mwh`; nulls are empty fields.
pub fn write_rows<W: Write>(out: W, rows: &[MasterRow]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    if rows.is_empty() {
        writer.write_record(["city", "date", "tmax_f", "tmin_f", "energy_mwh"])?;
    }
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("serialize row {} {:?}", row.city, row.date))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_rows<R: Read>(input: R) -> Result<Vec<MasterRow>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(input);
    let mut rows = Vec::new();
    for (i, record) in reader.deserialize::<MasterRow>().enumerate() {
        rows.push(record.with_context(|| format!("Malformed master row {}", i + 1))?);
    }
    Ok(rows)
}

// ── Master table file ─────────────────────────────────────────────────────────

pub struct MasterStore {
    path: PathBuf,
}

impl MasterStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows of the previous run. No file yet means no history.
    pub fn load(&self) -> Result<Vec<MasterRow>> {
        if !self.path.exists() {
            debug!("No master table at {:?} yet", self.path);
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open master table {:?}", self.path))?;
        let rows = read_rows(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to read master table {:?}", self.path))?;
        debug!("Loaded {} rows from {:?}", rows.len(), self.path);
        Ok(rows)
    }

    /// Snapshot-replace the master table with `rows`.
    pub fn save(&self, rows: &[MasterRow]) -> Result<usize> {
        let mut buf = Vec::new();
        write_rows(&mut buf, rows)?;
        write_atomically(&self.path, &buf)?;
        info!("Saved master table: {} rows → {:?}", rows.len(), self.path);
        Ok(rows.len())
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<MasterStats> {
        Ok(MasterStats::from_rows(&self.load()?))
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct MasterStats {
    pub rows: usize,
    pub per_city: BTreeMap<String, usize>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

impl MasterStats {
    pub fn from_rows(rows: &[MasterRow]) -> Self {
        let mut stats = MasterStats {
            rows: rows.len(),
            ..Default::default()
        };
        for row in rows {
            *stats.per_city.entry(row.city.clone()).or_default() += 1;
        }
        let dates = rows.iter().filter_map(|r| r.date);
        stats.first_date = dates.clone().min();
        stats.last_date = dates.max();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(city: &str, date: Option<(i32, u32, u32)>, tmax: Option<f64>, mwh: Option<f64>) -> MasterRow {
        MasterRow {
            city: city.to_string(),
            date: date.map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap()),
            tmax_f: tmax,
            tmin_f: None,
            energy_mwh: mwh,
        }
    }

    #[test]
    fn test_csv_layout() {
        let rows = vec![
            MasterRow::placeholder("Boise"),
            row("New York", Some((2024, 1, 1)), Some(50.0), Some(1234.5)),
        ];
        let mut buf = Vec::new();
        write_rows(&mut buf, &rows).unwrap();

        assert_eq!(
            String::from_utf8(buf.clone()).unwrap(),
            "city,date,tmax_f,tmin_f,energy_mwh\nBoise,,,,\nNew York,2024-01-01,50.0,,1234.5\n"
        );
        assert_eq!(read_rows(buf.as_slice()).unwrap(), rows);
    }

    #[test]
    fn test_empty_table_still_has_header() {
        let mut buf = Vec::new();
        write_rows(&mut buf, &[]).unwrap();
        assert_eq!(String::from_utf8(buf.clone()).unwrap(), "city,date,tmax_f,tmin_f,energy_mwh\n");
        assert!(read_rows(buf.as_slice()).unwrap().is_empty());
    }

    #[test]
    fn test_store_load_missing_then_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = MasterStore::open(dir.path().join("out").join("master.csv"));
        assert!(store.load().unwrap().is_empty());

        store.save(&[row("A", Some((2024, 1, 1)), None, Some(1.0)), row("A", Some((2024, 1, 2)), None, None)]).unwrap();
        store.save(&[row("B", Some((2024, 2, 1)), Some(70.0), None)]).unwrap();

        let rows = store.load().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].city, "B");
        assert!(!dir.path().join("out").join("master.csv.tmp").exists());
    }

    #[test]
    fn test_malformed_master_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.csv");
        std::fs::write(&path, "city,date,tmax_f,tmin_f,energy_mwh\nA,not-a-date,,,\n").unwrap();
        assert!(MasterStore::open(&path).load().is_err());
    }

    #[test]
    fn test_stats() {
        let rows = vec![
            MasterRow::placeholder("C"),
            row("A", Some((2024, 1, 3)), None, None),
            row("A", Some((2023, 12, 30)), None, None),
        ];
        let stats = MasterStats::from_rows(&rows);
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.per_city["A"], 2);
        assert_eq!(stats.per_city["C"], 1);
        assert_eq!(stats.first_date, NaiveDate::from_ymd_opt(2023, 12, 30));
        assert_eq!(stats.last_date, NaiveDate::from_ymd_opt(2024, 1, 3));
    }
}
