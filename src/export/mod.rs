use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::db::Database;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    /// Pick the format from the output file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => bail!("cannot infer export format from {} (use .csv or .json)", path.display()),
        }
    }
}

/// Identity data for export; the embedding is left out
#[derive(Debug, Serialize)]
pub struct ExportedPerson {
    pub id: i64,
    pub label: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub visit_count: i64,
    pub daily_visit_count: i64,
    pub last_visit_date: NaiveDate,
}

/// Export daily totals between `from` and `to` inclusive
pub fn export_daily(
    db: &Database,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    output_path: &Path,
    format: ExportFormat,
) -> Result<usize> {
    let days = db.get_daily_analytics(from, to)?;

    match format {
        ExportFormat::Json => export_json(&days, output_path)?,
        ExportFormat::Csv => {
            let mut wtr = csv::Writer::from_path(output_path)?;
            wtr.write_record(["day", "total_flow", "unique_count"])?;
            for day in &days {
                wtr.write_record([
                    day.day.to_string(),
                    day.total_flow.to_string(),
                    day.unique_count.to_string(),
                ])?;
            }
            wtr.flush()?;
        }
    }

    Ok(days.len())
}

/// Export every identity in id order
pub fn export_people(db: &Database, output_path: &Path, format: ExportFormat) -> Result<usize> {
    let people: Vec<ExportedPerson> = db
        .list_identities()?
        .into_iter()
        .map(|identity| ExportedPerson {
            id: identity.id,
            label: identity.label,
            first_seen: identity.first_seen,
            last_seen: identity.last_seen,
            visit_count: identity.visit_count,
            daily_visit_count: identity.daily_visit_count,
            last_visit_date: identity.last_visit_date,
        })
        .collect();

    match format {
        ExportFormat::Json => export_json(&people, output_path)?,
        ExportFormat::Csv => {
            let mut wtr = csv::Writer::from_path(output_path)?;
            wtr.write_record([
                "id",
                "label",
                "first_seen",
                "last_seen",
                "visit_count",
                "daily_visit_count",
                "last_visit_date",
            ])?;
            for person in &people {
                wtr.write_record([
                    person.id.to_string(),
                    person.label.clone(),
                    person.first_seen.to_rfc3339(),
                    person.last_seen.to_rfc3339(),
                    person.visit_count.to_string(),
                    person.daily_visit_count.to_string(),
                    person.last_visit_date.to_string(),
                ])?;
            }
            wtr.flush()?;
        }
    }

    Ok(people.len())
}

fn export_json<T: Serialize>(rows: &[T], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(rows)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::testing::axis;
    use crate::identity::{Resolver, ResolverSettings};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn populated() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let resolver = Resolver::new(Arc::new(db), ResolverSettings::default());
        let t = |d, h| Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).unwrap();
        resolver.resolve(&axis(0), t(1, 9)).unwrap();
        resolver.resolve(&axis(1), t(1, 10)).unwrap();
        resolver.resolve(&axis(0), t(2, 9)).unwrap();
        Arc::clone(resolver.database())
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ExportFormat::from_path(Path::new("out/daily.CSV")).unwrap(), ExportFormat::Csv);
        assert_eq!(ExportFormat::from_path(Path::new("people.json")).unwrap(), ExportFormat::Json);
        assert!(ExportFormat::from_path(Path::new("people.html")).is_err());
    }

    #[test]
    fn test_export_daily_csv() {
        let db = populated();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daily.csv");

        let rows = export_daily(&db, None, None, &path, ExportFormat::Csv).unwrap();
        assert_eq!(rows, 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["day,total_flow,unique_count", "2026-03-01,2,2", "2026-03-02,1,1"]);
    }

    #[test]
    fn test_export_people_json() {
        let db = populated();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.json");

        assert_eq!(export_people(&db, &path, ExportFormat::Json).unwrap(), 2);

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let people = parsed.as_array().unwrap();
        assert_eq!(people[0]["visit_count"], 2);
        assert_eq!(people[0]["label"], "unknown");
        assert_eq!(people[1]["last_visit_date"], "2026-03-01");
        assert!(people[0].get("embedding").is_none());
    }
}
