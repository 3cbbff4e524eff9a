//! Data set manifests
//!
//! Every batch the data provider uploads is described by a manifest object
//! stored next to its data files:
//!
//! ```text
//! Incoming/2024-01-18T10:00:00Z/0_manifest.xml
//! Incoming/2024-01-18T10:00:00Z/beneficiaries.rif
//! ```
//!
//! The identity of a batch comes from the manifest's key; the XML body lists
//! the data files and, for synthetic batches, optional pre-validation
//! properties.

use ccw_common::{PipelineError, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const MANIFEST_FILE_SUFFIX: &str = "_manifest.xml";

const INCOMING_KEY_PATTERN: &str = r"^(Incoming|Synthetic/Incoming)/(.*)/([0-9]+)_manifest\.xml$";
const COMPLETED_KEY_PATTERN: &str = r"^(Done|Synthetic/Done)/(.*)/([0-9]+)_manifest\.xml$";

/// Where a batch's objects live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestLocation {
    Incoming,
    IncomingSynthetic,
    Done,
    DoneSynthetic,
    FailedSynthetic,
}

impl ManifestLocation {
    pub fn prefix(self) -> &'static str {
        match self {
            ManifestLocation::Incoming => "Incoming",
            ManifestLocation::IncomingSynthetic => "Synthetic/Incoming",
            ManifestLocation::Done => "Done",
            ManifestLocation::DoneSynthetic => "Synthetic/Done",
            ManifestLocation::FailedSynthetic => "Synthetic/Failed",
        }
    }

    pub fn incoming(synthetic: bool) -> Self {
        if synthetic {
            ManifestLocation::IncomingSynthetic
        } else {
            ManifestLocation::Incoming
        }
    }

    pub fn done(synthetic: bool) -> Self {
        if synthetic {
            ManifestLocation::DoneSynthetic
        } else {
            ManifestLocation::Done
        }
    }

    /// Both prefixes new batches are uploaded under
    pub fn incoming_prefixes() -> [ManifestLocation; 2] {
        [ManifestLocation::Incoming, ManifestLocation::IncomingSynthetic]
    }

    pub fn completed_prefixes() -> [ManifestLocation; 2] {
        [ManifestLocation::Done, ManifestLocation::DoneSynthetic]
    }
}

impl fmt::Display for ManifestLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Kind of RIF data file referenced by a manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RifFileType {
    Beneficiary,
    BeneficiaryHistory,
    MedicareBeneficiaryIdHistory,
    Pde,
    Carrier,
    Inpatient,
    Outpatient,
    Snf,
    Hospice,
    Hha,
    Dme,
}

impl RifFileType {
    pub const ALL: [RifFileType; 11] = [
        RifFileType::Beneficiary,
        RifFileType::BeneficiaryHistory,
        RifFileType::MedicareBeneficiaryIdHistory,
        RifFileType::Pde,
        RifFileType::Carrier,
        RifFileType::Inpatient,
        RifFileType::Outpatient,
        RifFileType::Snf,
        RifFileType::Hospice,
        RifFileType::Hha,
        RifFileType::Dme,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RifFileType::Beneficiary => "BENEFICIARY",
            RifFileType::BeneficiaryHistory => "BENEFICIARY_HISTORY",
            RifFileType::MedicareBeneficiaryIdHistory => "MEDICARE_BENEFICIARY_ID_HISTORY",
            RifFileType::Pde => "PDE",
            RifFileType::Carrier => "CARRIER",
            RifFileType::Inpatient => "INPATIENT",
            RifFileType::Outpatient => "OUTPATIENT",
            RifFileType::Snf => "SNF",
            RifFileType::Hospice => "HOSPICE",
            RifFileType::Hha => "HHA",
            RifFileType::Dme => "DME",
        }
    }
}

impl FromStr for RifFileType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RifFileType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown RIF file type '{}'", s))
    }
}

impl fmt::Display for RifFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a batch, taken from its manifest key.
///
/// Orders by timestamp, then sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataSetManifestId {
    pub timestamp: DateTime<Utc>,
    pub sequence_id: u32,
    pub synthetic: bool,
}

impl fmt::Display for DataSetManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.sequence_id
        )?;
        if self.synthetic {
            f.write_str(" (synthetic)")?;
        }
        Ok(())
    }
}

/// Parts of an incoming manifest key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingManifestKey {
    pub id: DataSetManifestId,
    /// Timestamp folder exactly as it appears in the key
    pub timestamp_text: String,
    pub file_name: String,
}

/// Recognises manifest keys under the incoming and completed prefixes
#[derive(Debug, Clone)]
pub struct ManifestKeyMatcher {
    incoming: Regex,
    completed: Regex,
}

impl ManifestKeyMatcher {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| PipelineError::Config(format!("invalid manifest key pattern: {}", e)))
        };
        Ok(Self {
            incoming: compile(INCOMING_KEY_PATTERN)?,
            completed: compile(COMPLETED_KEY_PATTERN)?,
        })
    }

    /// `Ok(None)` for keys that are not incoming manifests (data files, folders)
    pub fn parse_incoming(&self, key: &str) -> Result<Option<IncomingManifestKey>> {
        let Some(caps) = self.incoming.captures(key) else {
            return Ok(None);
        };

        let synthetic = &caps[1] == ManifestLocation::IncomingSynthetic.prefix();
        let timestamp_text = caps[2].to_string();
        let timestamp = parse_timestamp(&timestamp_text)
            .map_err(|reason| PipelineError::malformed(key, reason))?;
        let sequence_id = caps[3]
            .parse::<u32>()
            .map_err(|e| PipelineError::malformed(key, format!("bad sequence id: {}", e)))?;
        let file_name = format!("{}{}", &caps[3], MANIFEST_FILE_SUFFIX);

        Ok(Some(IncomingManifestKey {
            id: DataSetManifestId {
                timestamp,
                sequence_id,
                synthetic,
            },
            timestamp_text,
            file_name,
        }))
    }

    pub fn is_completed(&self, key: &str) -> bool {
        self.completed.is_match(key)
    }
}

fn parse_timestamp(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(0))
        .map_err(|e| format!("bad timestamp '{}': {}", text, e))
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    #[serde(rename = "@sequenceId")]
    sequence_id: u32,
    #[serde(rename = "@syntheticData", default)]
    synthetic_data: Option<bool>,
    #[serde(rename = "entry", default)]
    entries: Vec<EntryElement>,
    #[serde(rename = "preValidationProperties", default)]
    pre_validation_properties: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct EntryElement {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@type")]
    rif_type: String,
    #[serde(rename = "@exportType", default)]
    export_type: Option<String>,
}

/// One data file of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetManifestEntry {
    pub name: String,
    pub rif_type: RifFileType,
    pub export_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DataSetManifest {
    id: DataSetManifestId,
    timestamp_text: String,
    manifest_file_name: String,
    entries: Vec<DataSetManifestEntry>,
    pre_validation_properties: Option<BTreeMap<String, String>>,
    target: ManifestLocation,
}

impl DataSetManifest {
    /// Parse the manifest stored at `key`. The document must agree with the identity in the key.
    pub fn parse(key: &IncomingManifestKey, full_key: &str, body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|e| PipelineError::malformed(full_key, format!("not UTF-8: {}", e)))?;
        let doc: ManifestDocument = quick_xml::de::from_str(text)
            .map_err(|e| PipelineError::malformed(full_key, e.to_string()))?;

        let timestamp =
            parse_timestamp(&doc.timestamp).map_err(|reason| PipelineError::malformed(full_key, reason))?;
        if timestamp != key.id.timestamp {
            return Err(PipelineError::malformed(
                full_key,
                format!("timestamp '{}' does not match the key", doc.timestamp),
            ));
        }
        if doc.sequence_id != key.id.sequence_id {
            return Err(PipelineError::malformed(
                full_key,
                format!("sequenceId {} does not match the key", doc.sequence_id),
            ));
        }
        if doc.synthetic_data.is_some_and(|synthetic| synthetic != key.id.synthetic) {
            return Err(PipelineError::malformed(
                full_key,
                "syntheticData does not match the key prefix",
            ));
        }
        if doc.entries.is_empty() {
            return Err(PipelineError::malformed(full_key, "manifest lists no entries"));
        }

        let entries = doc
            .entries
            .into_iter()
            .map(|entry| {
                if entry.name.trim().is_empty() {
                    return Err(PipelineError::malformed(full_key, "entry without a name"));
                }
                let rif_type = entry
                    .rif_type
                    .parse()
                    .map_err(|reason: String| PipelineError::malformed(full_key, reason))?;
                Ok(DataSetManifestEntry {
                    name: entry.name,
                    rif_type,
                    export_type: entry.export_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: key.id,
            timestamp_text: key.timestamp_text.clone(),
            manifest_file_name: key.file_name.clone(),
            entries,
            pre_validation_properties: doc.pre_validation_properties.filter(|p| !p.is_empty()),
            target: ManifestLocation::done(key.id.synthetic),
        })
    }

    pub fn id(&self) -> DataSetManifestId {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.id.timestamp
    }

    pub fn timestamp_text(&self) -> &str {
        &self.timestamp_text
    }

    pub fn sequence_id(&self) -> u32 {
        self.id.sequence_id
    }

    pub fn is_synthetic(&self) -> bool {
        self.id.synthetic
    }

    pub fn entries(&self) -> &[DataSetManifestEntry] {
        &self.entries
    }

    pub fn pre_validation_properties(&self) -> Option<&BTreeMap<String, String>> {
        self.pre_validation_properties.as_ref()
    }

    pub fn incoming_location(&self) -> ManifestLocation {
        ManifestLocation::incoming(self.id.synthetic)
    }

    /// Where the relocation will move this batch
    pub fn target_location(&self) -> ManifestLocation {
        self.target
    }

    pub fn redirect_to_failed(&mut self) {
        self.target = ManifestLocation::FailedSynthetic;
    }

    /// Prefix the data files are expected under, with trailing slash
    pub fn key_prefix(&self) -> String {
        format!("{}/{}/", self.incoming_location().prefix(), self.timestamp_text)
    }

    pub fn incoming_key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix(), name)
    }

    pub fn target_key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.target.prefix(), self.timestamp_text, name)
    }

    pub fn manifest_file_name(&self) -> &str {
        &self.manifest_file_name
    }

    pub fn manifest_key(&self) -> String {
        self.incoming_key(&self.manifest_file_name)
    }

    pub fn contains_only(&self, rif_type: RifFileType) -> bool {
        self.entries.iter().all(|e| e.rif_type == rif_type)
    }
}
