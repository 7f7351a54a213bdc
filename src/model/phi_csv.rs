//! PHI CSV export: one row per imported study, pairing every pseudonym
//! with the PHI value it replaced.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::anonymizer::dates::shift_date;
use crate::error::{Error, Result};
use crate::model::AnonymizerModel;

pub const HEADER: [&str; 13] = [
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
    "NumberOfSeries",
    "NumberOfInstances",
];

/// Write the PHI CSV into `export_dir`, returning the file path.
pub fn create_phi_csv(model: &AnonymizerModel, export_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(export_dir).map_err(|source| Error::Storage {
        path: export_dir.display().to_string(),
        source,
    })?;
    let path = export_dir.join(format!(
        "phi_{}.csv",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    let mut writer = csv::Writer::from_path(&path).map_err(|e| Error::Storage {
        path: path.display().to_string(),
        source: std::io::Error::other(e),
    })?;
    writer.write_record(HEADER).map_err(|e| Error::Storage {
        path: path.display().to_string(),
        source: std::io::Error::other(e),
    })?;

    let mut rows = 0usize;
    for (anon_pt_id, phi) in model.patients() {
        for study in &phi.studies {
            let anon_acc = model
                .get_anon_acc_no(&study.accession_number)
                .unwrap_or_default();
            let anon_study_uid = model.get_anon_uid(&study.study_uid).unwrap_or_default();
            let anon_study_date = shift_date(&study.study_date, study.anon_date_delta)
                .unwrap_or_else(|| study.study_date.clone());
            let record = [
                anon_pt_id.as_str(),
                anon_pt_id.as_str(),
                phi.patient_id.as_str(),
                phi.patient_name.as_str(),
                &study.anon_date_delta.to_string(),
                anon_acc,
                study.accession_number.as_str(),
                anon_study_uid,
                study.study_uid.as_str(),
                &anon_study_date,
                study.study_date.as_str(),
                &study.series.len().to_string(),
                &study.instance_count().to_string(),
            ];
            writer.write_record(record).map_err(|e| Error::Storage {
                path: path.display().to_string(),
                source: std::io::Error::other(e),
            })?;
            rows += 1;
        }
    }
    writer.flush().map_err(|source| Error::Storage {
        path: path.display().to_string(),
        source,
    })?;
    info!("wrote {rows} PHI rows to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceAttrs;
    use tempfile::TempDir;

    #[test]
    fn one_row_per_study_in_column_order() {
        let mut model = AnonymizerModel::new("RSNA-0001", "1.2.826.0.1.3680043.10.474");
        let attrs = InstanceAttrs {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            study_uid: "1.2.3.4".into(),
            series_uid: "1.2.3.4.1".into(),
            sop_uid: "1.2.3.4.1.1".into(),
            patient_id: "X123".into(),
            patient_name: "DOE^JOHN".into(),
            study_date: "20200115".into(),
            accession_number: "ACC-1".into(),
            modality: "CT".into(),
            ..InstanceAttrs::default()
        };
        model.capture_phi("PACS", &attrs, 154).unwrap();
        model.get_next_anon_uid("1.2.3.4");
        model.get_next_anon_acc_no("ACC-1");

        let tmp = TempDir::new().unwrap();
        let path = create_phi_csv(&model, tmp.path()).unwrap();
        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(
            reader.headers().unwrap().iter().collect::<Vec<_>>(),
            HEADER.to_vec()
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(&row[0], "RSNA-0001-000001");
        assert_eq!(&row[2], "X123");
        assert_eq!(&row[3], "DOE^JOHN");
        assert_eq!(&row[4], "154");
        assert_eq!(&row[5], "1");
        assert_eq!(&row[7], "1.2.826.0.1.3680043.10.474.RSNA-0001.1");
        assert_eq!(&row[9], "20200617");
        assert_eq!(&row[10], "20200115");
        assert_eq!(&row[11], "1");
        assert_eq!(&row[12], "1");
    }
}
