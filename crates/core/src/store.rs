//! Filesystem-backed record collaborator.
//!
//! [`LocalRecordStore`] is the development stand-in for the production record system. It keeps
//! one JSON file per patient, sharded by the SHA-256 of the patient identifier:
//!
//! ```text
//! Records/
//!   3f/
//!     a2/
//!       3fa2...e1.json
//! ```
//!
//! It accepts FHIR `Patient` resources, or `Bundle`s containing one, and builds the `ADT^A01`,
//! `ORM^O01` and `ORU^R01` messages the relay sends.

use crate::constants::{
    ASSIGNING_AUTHORITY, MAX_RECORD_BYTES, RECEIVING_APPLICATION, RECEIVING_FACILITY,
    SENDING_APPLICATION, SENDING_FACILITY,
};
use crate::{CollaboratorError, CollaboratorResult, MessageKind, RecordCollaborator};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use relay_hl7::{Encoding, Message, Segment};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// An order placed against a patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    /// ORC-2 placer order number.
    pub order_number: String,
    /// OBR-4 universal service identifier.
    pub service: String,
    /// OBR-7 observation date/time, as received.
    #[serde(default)]
    pub observed_at: String,
}

/// A single observation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationEntry {
    /// OBX-3 observation identifier.
    pub code: String,
    /// OBX-5 observation value.
    pub value: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub reference_range: String,
    #[serde(default)]
    pub abnormal_flag: String,
}

/// A patient record as stored by [`LocalRecordStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: String,
    pub family_name: String,
    #[serde(default)]
    pub given_names: Vec<String>,
    /// `YYYY-MM-DD`, empty when unknown.
    #[serde(default)]
    pub birth_date: String,
    /// FHIR administrative gender: `male`, `female`, `other` or `unknown`.
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub orders: Vec<OrderEntry>,
    #[serde(default)]
    pub results: Vec<ObservationEntry>,
}

impl PatientRecord {
    fn hl7_sex(&self) -> &'static str {
        match self.sex.as_str() {
            "male" => "M",
            "female" => "F",
            "other" => "O",
            _ => "U",
        }
    }

    fn hl7_birth_date(&self) -> String {
        NaiveDate::parse_from_str(&self.birth_date, "%Y-%m-%d")
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_default()
    }
}

/// JSON records under a directory.
#[derive(Debug, Clone)]
pub struct LocalRecordStore {
    root: PathBuf,
    max_record_bytes: usize,
}

impl LocalRecordStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_record_bytes: MAX_RECORD_BYTES,
        }
    }

    /// Overrides the largest serialised record accepted by [`RecordCollaborator::size_ok`].
    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record file for `id`.
    ///
    /// The identifier is hashed so that any text is usable as a file name, then sharded on the
    /// first four hex characters.
    pub fn record_path(&self, id: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(id.as_bytes()));
        self.root
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(format!("{}.json", hash))
    }

    /// Loads the stored record for `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError::FileRead` or `CollaboratorError::Deserialization` when the
    /// record file exists but cannot be loaded.
    pub fn load(&self, id: &str) -> CollaboratorResult<Option<PatientRecord>> {
        let path = self.record_path(id);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CollaboratorError::FileRead(e)),
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(CollaboratorError::Deserialization)
    }

    fn save(&self, record: &PatientRecord) -> CollaboratorResult<()> {
        let path = self.record_path(&record.id);
        let dir = path
            .parent()
            .ok_or_else(|| CollaboratorError::InvalidDocument("record path has no parent".into()))?;
        fs::create_dir_all(dir).map_err(CollaboratorError::FileWrite)?;

        let json =
            serde_json::to_string_pretty(record).map_err(CollaboratorError::Serialization)?;
        let tmp = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("record")
        ));
        let mut file = fs::File::create(&tmp).map_err(CollaboratorError::FileWrite)?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(CollaboratorError::FileWrite)?;
        fs::rename(&tmp, &path).map_err(CollaboratorError::FileWrite)?;

        tracing::debug!(id = %record.id, path = %path.display(), "record saved");
        Ok(())
    }

    /// Merges `incoming` into the stored record with `merge`; `404` when nothing is stored.
    fn update_with(
        &self,
        incoming: &PatientRecord,
        merge: impl FnOnce(&mut PatientRecord),
    ) -> CollaboratorResult<u16> {
        let Some(mut stored) = self.load(&incoming.id)? else {
            tracing::warn!(id = %incoming.id, "no stored record to update");
            return Ok(404);
        };
        merge(&mut stored);
        self.save(&stored)?;
        Ok(200)
    }

    /// Builds `kind` for `record`, stamped with `at`.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError::Hl7` if a segment cannot be constructed.
    pub fn build_message_at(
        &self,
        record: &PatientRecord,
        kind: MessageKind,
        at: DateTime<Utc>,
    ) -> CollaboratorResult<Message> {
        let encoding = Encoding::default();
        let esc = |text: &str| encoding.escape_text(text);
        let timestamp = at.format("%Y%m%d%H%M%S").to_string();

        let msh = Segment::msh(
            &encoding,
            vec![
                SENDING_APPLICATION.into(),
                SENDING_FACILITY.into(),
                RECEIVING_APPLICATION.into(),
                RECEIVING_FACILITY.into(),
                timestamp.clone(),
                String::new(),
                kind.to_string(),
                at.format("%Y%m%d%H%M%S%6f").to_string(),
                "P".into(),
                "2.4".into(),
            ],
        );
        let evn = Segment::new("EVN", vec![kind.trigger().into(), timestamp.clone()])?;
        let pid = Segment::new(
            "PID",
            vec![
                "1".into(),
                String::new(),
                format!("{}^^^{}^MR", esc(&record.id), ASSIGNING_AUTHORITY),
                String::new(),
                format!(
                    "{}^{}",
                    esc(&record.family_name),
                    esc(&record.given_names.join(" "))
                ),
                String::new(),
                record.hl7_birth_date(),
                record.hl7_sex().into(),
            ],
        )?;

        let mut segments = vec![msh, evn, pid];
        match kind {
            MessageKind::AdtA01 => {}
            MessageKind::OrmO01 => {
                for (i, order) in record.orders.iter().enumerate() {
                    segments.push(Segment::new(
                        "ORC",
                        vec!["NW".into(), esc(&order.order_number)],
                    )?);
                    segments.push(obr(i, order, &esc)?);
                }
            }
            MessageKind::OruR01 => {
                for (i, order) in record.orders.iter().enumerate() {
                    segments.push(obr(i, order, &esc)?);
                }
                for (i, result) in record.results.iter().enumerate() {
                    segments.push(Segment::new(
                        "OBX",
                        vec![
                            (i + 1).to_string(),
                            "ST".into(),
                            esc(&result.code),
                            String::new(),
                            esc(&result.value),
                            esc(&result.units),
                            esc(&result.reference_range),
                            esc(&result.abnormal_flag),
                            String::new(),
                            String::new(),
                            "F".into(),
                        ],
                    )?);
                }
            }
        }

        Ok(Message::new(encoding, segments)?)
    }
}

fn obr(
    index: usize,
    order: &OrderEntry,
    esc: &impl Fn(&str) -> String,
) -> CollaboratorResult<Segment> {
    Ok(Segment::new(
        "OBR",
        vec![
            (index + 1).to_string(),
            esc(&order.order_number),
            String::new(),
            esc(&order.service),
            String::new(),
            String::new(),
            esc(&order.observed_at),
        ],
    )?)
}

/// Finds the `Patient` resource in a document: the document itself or the first bundle entry.
fn find_patient(document: &Value) -> Option<&Value> {
    match document.get("resourceType").and_then(Value::as_str) {
        Some("Patient") => Some(document),
        Some("Bundle") => document
            .get("entry")?
            .as_array()?
            .iter()
            .filter_map(|entry| entry.get("resource"))
            .find(|r| r.get("resourceType").and_then(Value::as_str) == Some("Patient")),
        _ => None,
    }
}

fn patient_from_fhir(patient: &Value) -> CollaboratorResult<PatientRecord> {
    let id = patient
        .get("identifier")
        .and_then(|ids| ids.get(0))
        .and_then(|i| i.get("value"))
        .or_else(|| patient.get("id"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or(CollaboratorError::MissingField("identifier"))?;

    let name = patient.get("name").and_then(|n| n.get(0));
    let family_name = name
        .and_then(|n| n.get("family"))
        .and_then(Value::as_str)
        .ok_or(CollaboratorError::MissingField("name.family"))?;
    let given_names = name
        .and_then(|n| n.get("given"))
        .and_then(Value::as_array)
        .map(|given| {
            given
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let text = |key: &str| {
        patient
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };

    Ok(PatientRecord {
        id: id.trim().to_owned(),
        family_name: family_name.to_owned(),
        given_names,
        birth_date: text("birthDate"),
        sex: text("gender"),
        orders: Vec::new(),
        results: Vec::new(),
    })
}

/// First component of a field, or the empty string.
fn component<'a>(message: &Message, segment: &'a Segment, n: usize) -> &'a str {
    let separator = message.encoding().component_separator();
    segment
        .field(n)
        .and_then(|f| f.split(separator).next())
        .unwrap_or_default()
}

#[async_trait]
impl RecordCollaborator for LocalRecordStore {
    type Record = PatientRecord;

    async fn parse(&self, document: &str) -> CollaboratorResult<PatientRecord> {
        let value: Value = serde_json::from_str(document)
            .map_err(|e| CollaboratorError::InvalidDocument(e.to_string()))?;
        let patient = find_patient(&value).ok_or_else(|| {
            CollaboratorError::InvalidDocument("no Patient resource in document".into())
        })?;
        patient_from_fhir(patient)
    }

    async fn size_ok(&self, record: &PatientRecord) -> CollaboratorResult<bool> {
        let bytes = serde_json::to_vec(record).map_err(CollaboratorError::Serialization)?;
        Ok(bytes.len() <= self.max_record_bytes)
    }

    async fn exists(&self, record: &PatientRecord) -> CollaboratorResult<bool> {
        Ok(self.record_path(&record.id).is_file())
    }

    async fn persist(&self, record: &PatientRecord, is_update: bool) -> CollaboratorResult<u16> {
        if !is_update && self.record_path(&record.id).exists() {
            tracing::warn!(id = %record.id, "record already exists");
            return Ok(409);
        }
        self.save(record)?;
        Ok(200)
    }

    async fn build_outbound_message(
        &self,
        record: &PatientRecord,
        kind: MessageKind,
    ) -> CollaboratorResult<Message> {
        self.build_message_at(record, kind, Utc::now())
    }

    async fn record_from_message(&self, message: &Message) -> CollaboratorResult<PatientRecord> {
        let pid = message
            .segment("PID")
            .ok_or(CollaboratorError::MissingField("PID"))?;

        let id = component(message, pid, 3);
        if id.trim().is_empty() {
            return Err(CollaboratorError::MissingField("PID-3"));
        }

        let separator = message.encoding().component_separator();
        let mut name = pid.field(5).unwrap_or_default().split(separator);
        let family_name = name.next().unwrap_or_default().to_owned();
        let given_names = name
            .next()
            .filter(|g| !g.is_empty())
            .map(|g| vec![g.to_owned()])
            .unwrap_or_default();

        let birth_date = NaiveDate::parse_from_str(pid.field(7).unwrap_or_default(), "%Y%m%d")
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let sex = match pid.field(8).unwrap_or_default() {
            "M" => "male",
            "F" => "female",
            "O" => "other",
            _ => "unknown",
        };

        let orders = message
            .segments()
            .iter()
            .filter(|s| s.kind() == "OBR")
            .map(|obr| OrderEntry {
                order_number: [component(message, obr, 2), component(message, obr, 3)]
                    .into_iter()
                    .find(|n| !n.is_empty())
                    .or_else(|| {
                        message
                            .segment("ORC")
                            .map(|orc| component(message, orc, 2))
                    })
                    .unwrap_or_default()
                    .to_owned(),
                service: obr.field(4).unwrap_or_default().to_owned(),
                observed_at: obr.field(7).unwrap_or_default().to_owned(),
            })
            .collect();

        let results = message
            .segments()
            .iter()
            .filter(|s| s.kind() == "OBX")
            .map(|obx| {
                let field = |n: usize| obx.field(n).unwrap_or_default().to_owned();
                ObservationEntry {
                    code: field(3),
                    value: field(5),
                    units: field(6),
                    reference_range: field(7),
                    abnormal_flag: field(8),
                }
            })
            .collect();

        Ok(PatientRecord {
            id: id.trim().to_owned(),
            family_name,
            given_names,
            birth_date,
            sex: sex.into(),
            orders,
            results,
        })
    }

    async fn update_following_order(&self, record: &PatientRecord) -> CollaboratorResult<u16> {
        self.update_with(record, |stored| {
            for order in &record.orders {
                if !stored.orders.contains(order) {
                    stored.orders.push(order.clone());
                }
            }
        })
    }

    async fn update_following_result(&self, record: &PatientRecord) -> CollaboratorResult<u16> {
        self.update_with(record, |stored| {
            for order in &record.orders {
                if !stored.orders.iter().any(|o| o.order_number == order.order_number) {
                    stored.orders.push(order.clone());
                }
            }
            stored.results.extend(record.results.iter().cloned());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const PATIENT: &str = r#"{
        "resourceType": "Patient",
        "id": "internal-1",
        "identifier": [{"system": "urn:example", "value": "SYN0004S"}],
        "name": [{"use": "official", "family": "Stamm", "given": ["Cornell", "Leo"]}],
        "gender": "male",
        "birthDate": "1994-01-01"
    }"#;

    const ORDER: &str = "MSH|^~\\&|PAS|UHC|ULTRA|ULTRA|20240801000000||ORM^O01|934ZY|P|2.4\r\
        PID|1||SYN0004S^^^^PAS^MR||Stamm^Cornell||19940101|M\r\
        ORC|O|934ZY|1^^70980^408\r\
        OBR|1|934ZY|1^^70980^408|R-ANKLE^Ankle X-ray^L||202407310000|202408010000";

    const RESULT: &str = "MSH|^~\\&|LAB|UHC|ULTRA|ULTRA|20240808120000||ORU^R01|555|P|2.4\r\
        PID|1||SYN0004S^^^^PAS^MR||Stamm^Cornell||19940101|M\r\
        OBR|1||123456^LAB|123-4^Liver Function Test^L||20240808080000|20240808120000\r\
        OBX|1|NM|12256-3^ALT^LN||45|U/L|10-40|H|||F\r\
        OBX|2|NM|12257-1^AST^LN||30|U/L|10-40|N|||F";

    fn store() -> (TempDir, LocalRecordStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalRecordStore::new(temp_dir.path().join("Records"));
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_parse_patient_resource() {
        let (_tmp, store) = store();
        let record = store.parse(PATIENT).await.unwrap();
        assert_eq!(record.id, "SYN0004S");
        assert_eq!(record.family_name, "Stamm");
        assert_eq!(record.given_names, vec!["Cornell", "Leo"]);
        assert_eq!(record.birth_date, "1994-01-01");
        assert_eq!(record.sex, "male");
    }

    #[tokio::test]
    async fn test_parse_bundle_finds_patient() {
        let (_tmp, store) = store();
        let bundle = format!(
            r#"{{"resourceType": "Bundle", "entry": [
                {{"resource": {{"resourceType": "Encounter", "id": "e1"}}}},
                {{"resource": {}}}
            ]}}"#,
            PATIENT
        );
        let record = store.parse(&bundle).await.unwrap();
        assert_eq!(record.id, "SYN0004S");
    }

    #[tokio::test]
    async fn test_parse_rejects_bad_documents() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.parse("not json").await,
            Err(CollaboratorError::InvalidDocument(_))
        ));
        assert!(matches!(
            store.parse(r#"{"resourceType": "Observation"}"#).await,
            Err(CollaboratorError::InvalidDocument(_))
        ));
        assert!(matches!(
            store
                .parse(r#"{"resourceType": "Patient", "id": "p1"}"#)
                .await,
            Err(CollaboratorError::MissingField("name.family"))
        ));
    }

    #[tokio::test]
    async fn test_persist_refuses_duplicates_unless_update() {
        let (_tmp, store) = store();
        let record = store.parse(PATIENT).await.unwrap();

        assert!(!store.exists(&record).await.unwrap());
        assert_eq!(store.persist(&record, false).await.unwrap(), 200);
        assert!(store.exists(&record).await.unwrap());
        assert_eq!(store.persist(&record, false).await.unwrap(), 409);
        assert_eq!(store.persist(&record, true).await.unwrap(), 200);

        let path = store.record_path("SYN0004S");
        assert!(path.starts_with(store.root()));
        assert_eq!(store.load("SYN0004S").unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_size_limit() {
        let (_tmp, store) = store();
        let record = store.parse(PATIENT).await.unwrap();
        assert!(store.size_ok(&record).await.unwrap());

        let small = store.clone().with_max_record_bytes(16);
        assert!(!small.size_ok(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_build_admission_message() {
        let (_tmp, store) = store();
        let record = store.parse(PATIENT).await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 8, 1, 9, 30, 0).unwrap();

        let message = store
            .build_message_at(&record, MessageKind::AdtA01, at)
            .unwrap();
        assert!(message.validate().is_ok());
        assert!(message.message_type().unwrap().is("ADT", "A01"));
        assert_eq!(message.control_id(), Some("20240801093000000000"));

        let pid = message.segment("PID").unwrap();
        assert_eq!(pid.field(3), Some("SYN0004S^^^RELAY^MR"));
        assert_eq!(pid.field(5), Some("Stamm^Cornell Leo"));
        assert_eq!(pid.field(7), Some("19940101"));
        assert_eq!(pid.field(8), Some("M"));
    }

    #[tokio::test]
    async fn test_built_fields_are_escaped() {
        let (_tmp, store) = store();
        let mut record = store.parse(PATIENT).await.unwrap();
        record.family_name = "O|Brien^".into();

        let message = store
            .build_outbound_message(&record, MessageKind::AdtA01)
            .await
            .unwrap();
        let reparsed = Message::parse(&message.to_string()).unwrap();
        assert_eq!(reparsed, message);
        assert_eq!(
            reparsed.segment("PID").unwrap().field(5),
            Some("O\\F\\Brien\\S\\^Cornell Leo")
        );
    }

    #[tokio::test]
    async fn test_record_from_order_message() {
        let (_tmp, store) = store();
        let message = Message::parse(ORDER).unwrap();
        let record = store.record_from_message(&message).await.unwrap();

        assert_eq!(record.id, "SYN0004S");
        assert_eq!(record.family_name, "Stamm");
        assert_eq!(record.birth_date, "1994-01-01");
        assert_eq!(record.sex, "male");
        assert_eq!(record.orders.len(), 1);
        assert_eq!(record.orders[0].order_number, "934ZY");
        assert_eq!(record.orders[0].service, "R-ANKLE^Ankle X-ray^L");
    }

    #[tokio::test]
    async fn test_record_from_message_requires_pid() {
        let (_tmp, store) = store();
        let message =
            Message::parse("MSH|^~\\&|A|B|C|D|20240101000000||ORM^O01|1|P|2.4\rEVN|O01").unwrap();
        assert!(matches!(
            store.record_from_message(&message).await,
            Err(CollaboratorError::MissingField("PID"))
        ));
    }

    #[tokio::test]
    async fn test_updates_merge_into_stored_record() {
        let (_tmp, store) = store();
        let order = store
            .record_from_message(&Message::parse(ORDER).unwrap())
            .await
            .unwrap();

        assert_eq!(store.update_following_order(&order).await.unwrap(), 404);

        let patient = store.parse(PATIENT).await.unwrap();
        store.persist(&patient, false).await.unwrap();
        assert_eq!(store.update_following_order(&order).await.unwrap(), 200);
        assert_eq!(store.update_following_order(&order).await.unwrap(), 200);

        let result = store
            .record_from_message(&Message::parse(RESULT).unwrap())
            .await
            .unwrap();
        assert_eq!(store.update_following_result(&result).await.unwrap(), 200);

        let stored = store.load("SYN0004S").unwrap().unwrap();
        assert_eq!(stored.given_names, vec!["Cornell", "Leo"]);
        assert_eq!(stored.orders.len(), 2);
        assert_eq!(stored.results.len(), 2);
        assert_eq!(stored.results[0].value, "45");
        assert_eq!(stored.results[0].abnormal_flag, "H");
    }

    #[tokio::test]
    async fn test_build_result_message_from_stored_record() {
        let (_tmp, store) = store();
        let record = store
            .record_from_message(&Message::parse(RESULT).unwrap())
            .await
            .unwrap();
        let message = store
            .build_outbound_message(&record, MessageKind::OruR01)
            .await
            .unwrap();

        assert!(message.message_type().unwrap().is("ORU", "R01"));
        let obx: Vec<_> = message
            .segments()
            .iter()
            .filter(|s| s.kind() == "OBX")
            .collect();
        assert_eq!(obx.len(), 2);
        assert_eq!(obx[1].field(5), Some("30"));
    }
}
