//! Import of a prior (Java) installation's PHI index from an Excel sheet.
//!
//! The sheet carries the same columns as the PHI CSV export minus the two
//! trailing counts; rows seed the lookup tables verbatim before any
//! counter allocation happens.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use tracing::warn;

use crate::error::{Error, Result};

pub const COLUMNS: [&str; 11] = [
    "ANON_PatientID",
    "ANON_PatientName",
    "PHI_PatientID",
    "PHI_PatientName",
    "DateOffset",
    "ANON_Accession",
    "PHI_Accession",
    "ANON_StudyInstanceUID",
    "PHI_StudyInstanceUID",
    "ANON_StudyDate",
    "PHI_StudyDate",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JavaPhiStudy {
    pub anon_patient_id: String,
    pub anon_patient_name: String,
    pub phi_patient_id: String,
    pub phi_patient_name: String,
    pub date_offset: i64,
    pub anon_accession: String,
    pub phi_accession: String,
    pub anon_study_uid: String,
    pub phi_study_uid: String,
    pub anon_study_date: String,
    pub phi_study_date: String,
}

fn cell_string(cell: Option<&Data>) -> String {
    match cell {
        Some(Data::String(s)) => s.trim().to_string(),
        Some(Data::Float(f)) => {
            if f.fract() == 0.0 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Some(Data::Int(i)) => i.to_string(),
        Some(Data::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Read the first worksheet of `path` into index rows.
///
/// The header row must match [`COLUMNS`]; rows that lack an anonymous
/// patient id or study UID are skipped with a warning.
pub fn read_java_phi_studies(path: &Path) -> Result<Vec<JavaPhiStudy>> {
    let mut workbook = open_workbook_auto(path).map_err(|e| Error::Config {
        detail: format!("cannot open index sheet {}: {e}", path.display()),
    })?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| Error::Config {
            detail: format!("{} has no worksheets", path.display()),
        })?
        .map_err(|e| Error::Config {
            detail: format!("cannot read worksheet: {e}"),
        })?;

    let mut rows = range.rows();
    let header: Vec<String> = rows
        .next()
        .map(|r| r.iter().map(|c| cell_string(Some(c))).collect())
        .unwrap_or_default();
    if header.len() < COLUMNS.len()
        || COLUMNS.iter().zip(&header).any(|(want, got)| want != got)
    {
        return Err(Error::Config {
            detail: format!(
                "index sheet header {header:?} does not match the expected columns"
            ),
        });
    }

    let mut studies = Vec::new();
    for (i, row) in rows.enumerate() {
        let get = |idx: usize| cell_string(row.get(idx));
        let study = JavaPhiStudy {
            anon_patient_id: get(0),
            anon_patient_name: get(1),
            phi_patient_id: get(2),
            phi_patient_name: get(3),
            date_offset: get(4).parse().unwrap_or(0),
            anon_accession: get(5),
            phi_accession: get(6),
            anon_study_uid: get(7),
            phi_study_uid: get(8),
            anon_study_date: get(9),
            phi_study_date: get(10),
        };
        if study.anon_patient_id.is_empty() || study.phi_study_uid.is_empty() {
            warn!("skipping incomplete index row {}", i + 2);
            continue;
        }
        studies.push(study);
    }
    Ok(studies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::Workbook;
    use tempfile::TempDir;

    fn write_sheet(path: &Path, rows: &[[&str; 11]]) {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, name) in COLUMNS.iter().enumerate() {
            sheet.write_string(0, col as u16, *name).unwrap();
        }
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                sheet.write_string((r + 1) as u32, c as u16, *value).unwrap();
            }
        }
        workbook.save(path).unwrap();
    }

    #[test]
    fn reads_rows_and_skips_incomplete_ones() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.xlsx");
        write_sheet(
            &path,
            &[
                [
                    "RSNA-0001-000003",
                    "RSNA-0001-000003",
                    "OLD-77",
                    "DOE^JANE",
                    "211",
                    "12",
                    "ACC-OLD",
                    "1.2.826.0.1.3680043.10.474.RSNA-0001.9",
                    "5.5.5.1",
                    "20200814",
                    "20200115",
                ],
                // missing anon patient id → skipped
                [
                    "",
                    "",
                    "OLD-78",
                    "",
                    "0",
                    "",
                    "",
                    "",
                    "5.5.5.2",
                    "",
                    "",
                ],
            ],
        );
        let rows = read_java_phi_studies(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].phi_patient_id, "OLD-77");
        assert_eq!(rows[0].date_offset, 211);
        assert_eq!(rows[0].anon_study_uid, "1.2.826.0.1.3680043.10.474.RSNA-0001.9");
    }

    #[test]
    fn rejects_wrong_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.xlsx");
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "NotAColumn").unwrap();
        workbook.save(&path).unwrap();
        assert!(read_java_phi_studies(&path).is_err());
    }
}
