use serde::{Deserialize, Serialize};

/// One imaging series: the unit of work for the resolver and the download
/// engine. Immutable once constructed; a worker owns it exclusively for the
/// duration of its dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesRecord {
    #[serde(rename = "SeriesInstanceUID")]
    pub series_uid: String,
    #[serde(rename = "StudyInstanceUID", default)]
    pub study_uid: String,
    #[serde(rename = "PatientID", default)]
    pub subject_id: String,
    #[serde(rename = "StudyDate", default)]
    pub study_date: String,
    #[serde(rename = "Collection", default)]
    pub collection: String,
    #[serde(rename = "FileSize", default)]
    pub file_size_uncompressed: Option<u64>,
    #[serde(rename = "Modality", default)]
    pub modality: String,
    #[serde(rename = "SeriesDescription", default)]
    pub series_description: String,
    #[serde(rename = "SeriesNumber", default)]
    pub series_number: Option<i64>,
    #[serde(rename = "ImageCount", default)]
    pub number_of_images: Option<u64>,

    /// Whatever else the upstream sends that we don't have a named field for.
    /// Kept so the cached JSON round-trips the full record even as the
    /// upstream API grows fields we don't care about yet.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SeriesRecord {
    pub fn is_valid(&self) -> bool {
        !self.series_uid.is_empty()
    }
}

/// The metadata endpoint may respond with a single object or an array of
/// them; this normalizes both shapes to a `Vec`.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum MetadataResponse {
    One(SeriesRecord),
    Many(Vec<SeriesRecord>),
}

impl MetadataResponse {
    pub fn into_records(self) -> Vec<SeriesRecord> {
        match self {
            MetadataResponse::One(r) => vec![r],
            MetadataResponse::Many(rs) => rs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_object() {
        let body = r#"{"SeriesInstanceUID": "1.2.3", "Collection": "TCGA-X"}"#;
        let parsed: MetadataResponse = serde_json::from_str(body).unwrap();
        let records = parsed.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].series_uid, "1.2.3");
        assert_eq!(records[0].collection, "TCGA-X");
    }

    #[test]
    fn parses_array() {
        let body = r#"[{"SeriesInstanceUID": "1"}, {"SeriesInstanceUID": "2"}]"#;
        let parsed: MetadataResponse = serde_json::from_str(body).unwrap();
        let records = parsed.into_records();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn keeps_unknown_fields_in_extra() {
        let body = r#"{"SeriesInstanceUID": "1.2.3", "ThirdPartyAnalysis": "yes"}"#;
        let record: SeriesRecord = serde_json::from_str(body).unwrap();
        assert_eq!(
            record.extra.get("ThirdPartyAnalysis").and_then(|v| v.as_str()),
            Some("yes")
        );
    }

    #[test]
    fn round_trips_through_cache_serialization() {
        let record = SeriesRecord {
            series_uid: "1.2.3".to_string(),
            study_uid: "9.9.9".to_string(),
            subject_id: "S1".to_string(),
            study_date: "20240101".to_string(),
            collection: "TCGA-X".to_string(),
            file_size_uncompressed: Some(1000),
            modality: "CT".to_string(),
            series_description: "chest".to_string(),
            series_number: Some(3),
            number_of_images: Some(12),
            extra: serde_json::Map::new(),
        };
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: SeriesRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.series_uid, record.series_uid);
        assert_eq!(decoded.file_size_uncompressed, record.file_size_uncompressed);
    }
}
