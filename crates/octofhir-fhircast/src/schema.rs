//! FHIRcast event and context schema.
//!
//! Static lookup tables describing which context keys each event carries,
//! the resource type bound to every key, and whether the key is required or
//! repeatable. STU2 keys that STU3 removed are kept as optional so payloads
//! from either revision validate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FhircastError;

/// FHIRcast event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "patient-open")]
    PatientOpen,
    #[serde(rename = "patient-close")]
    PatientClose,
    #[serde(rename = "imagingstudy-open")]
    ImagingStudyOpen,
    #[serde(rename = "imagingstudy-close")]
    ImagingStudyClose,
    #[serde(rename = "encounter-open")]
    EncounterOpen,
    #[serde(rename = "encounter-close")]
    EncounterClose,
    #[serde(rename = "diagnosticreport-open")]
    DiagnosticReportOpen,
    #[serde(rename = "diagnosticreport-close")]
    DiagnosticReportClose,
    #[serde(rename = "syncerror")]
    SyncError,
}

impl EventName {
    pub const ALL: [EventName; 9] = [
        EventName::PatientOpen,
        EventName::PatientClose,
        EventName::ImagingStudyOpen,
        EventName::ImagingStudyClose,
        EventName::EncounterOpen,
        EventName::EncounterClose,
        EventName::DiagnosticReportOpen,
        EventName::DiagnosticReportClose,
        EventName::SyncError,
    ];

    /// Returns the wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::PatientOpen => "patient-open",
            EventName::PatientClose => "patient-close",
            EventName::ImagingStudyOpen => "imagingstudy-open",
            EventName::ImagingStudyClose => "imagingstudy-close",
            EventName::EncounterOpen => "encounter-open",
            EventName::EncounterClose => "encounter-close",
            EventName::DiagnosticReportOpen => "diagnosticreport-open",
            EventName::DiagnosticReportClose => "diagnosticreport-close",
            EventName::SyncError => "syncerror",
        }
    }

    /// Check whether a string is a known event name.
    pub fn is_known(name: &str) -> bool {
        Self::ALL.iter().any(|event| event.as_str() == name)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = FhircastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| {
                let supported: Vec<&str> = Self::ALL.iter().map(EventName::as_str).collect();
                FhircastError::validation(format!(
                    "Must provide a valid FHIRcast event name. Supported events: {}",
                    supported.join(", ")
                ))
            })
    }
}

/// Resource types that may appear in a FHIRcast context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FhircastResourceType {
    Patient,
    Encounter,
    ImagingStudy,
    DiagnosticReport,
    OperationOutcome,
}

impl FhircastResourceType {
    pub const ALL: [FhircastResourceType; 5] = [
        FhircastResourceType::Patient,
        FhircastResourceType::Encounter,
        FhircastResourceType::ImagingStudy,
        FhircastResourceType::DiagnosticReport,
        FhircastResourceType::OperationOutcome,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FhircastResourceType::Patient => "Patient",
            FhircastResourceType::Encounter => "Encounter",
            FhircastResourceType::ImagingStudy => "ImagingStudy",
            FhircastResourceType::DiagnosticReport => "DiagnosticReport",
            FhircastResourceType::OperationOutcome => "OperationOutcome",
        }
    }
}

impl fmt::Display for FhircastResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FhircastResourceType {
    type Err = FhircastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|resource_type| resource_type.as_str() == s)
            .ok_or_else(|| {
                FhircastError::validation(format!("Unknown FHIRcast resource type: {s}"))
            })
    }
}

/// Binding of one context key within an event schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextKeySchema {
    pub key: &'static str,
    pub resource_type: FhircastResourceType,
    pub optional: bool,
    pub many_allowed: bool,
}

impl ContextKeySchema {
    const fn required(key: &'static str, resource_type: FhircastResourceType) -> Self {
        Self {
            key,
            resource_type,
            optional: false,
            many_allowed: false,
        }
    }

    const fn optional(key: &'static str, resource_type: FhircastResourceType) -> Self {
        Self {
            key,
            resource_type,
            optional: true,
            many_allowed: false,
        }
    }

    const fn many(mut self) -> Self {
        self.many_allowed = true;
        self
    }
}

use FhircastResourceType as R;

// `encounter` on patient events is STU2 only.
const PATIENT_CONTEXT: &[ContextKeySchema] = &[
    ContextKeySchema::required("patient", R::Patient),
    ContextKeySchema::optional("encounter", R::Encounter),
];

const IMAGING_STUDY_CONTEXT: &[ContextKeySchema] = &[
    ContextKeySchema::required("study", R::ImagingStudy),
    ContextKeySchema::optional("encounter", R::Encounter),
    ContextKeySchema::optional("patient", R::Patient),
];

const ENCOUNTER_CONTEXT: &[ContextKeySchema] = &[
    ContextKeySchema::required("encounter", R::Encounter),
    ContextKeySchema::required("patient", R::Patient),
];

const DIAGNOSTIC_REPORT_CONTEXT: &[ContextKeySchema] = &[
    ContextKeySchema::required("report", R::DiagnosticReport),
    ContextKeySchema::optional("encounter", R::Encounter),
    ContextKeySchema::optional("study", R::ImagingStudy).many(),
    ContextKeySchema::required("patient", R::Patient),
];

const SYNC_ERROR_CONTEXT: &[ContextKeySchema] =
    &[ContextKeySchema::required("operationoutcome", R::OperationOutcome)];

/// Context keys declared for an event, in declaration order.
pub fn schema_for(event: EventName) -> &'static [ContextKeySchema] {
    match event {
        EventName::PatientOpen | EventName::PatientClose => PATIENT_CONTEXT,
        EventName::ImagingStudyOpen | EventName::ImagingStudyClose => IMAGING_STUDY_CONTEXT,
        EventName::EncounterOpen | EventName::EncounterClose => ENCOUNTER_CONTEXT,
        EventName::DiagnosticReportOpen | EventName::DiagnosticReportClose => {
            DIAGNOSTIC_REPORT_CONTEXT
        }
        EventName::SyncError => SYNC_ERROR_CONTEXT,
    }
}

/// Look up a single key within an event schema.
pub fn key_schema(event: EventName, key: &str) -> Option<&'static ContextKeySchema> {
    schema_for(event).iter().find(|entry| entry.key == key)
}

/// Checks if a resource type name can be used in a FHIRcast context.
pub fn is_valid_resource_type(resource_type: &str) -> bool {
    FhircastResourceType::ALL
        .iter()
        .any(|known| known.as_str() == resource_type)
}

/// Canonical context key for a resource type.
pub fn canonical_key_for(resource_type: FhircastResourceType) -> &'static str {
    match resource_type {
        FhircastResourceType::ImagingStudy => "study",
        FhircastResourceType::Patient => "patient",
        FhircastResourceType::Encounter => "encounter",
        FhircastResourceType::DiagnosticReport => "report",
        FhircastResourceType::OperationOutcome => "operationoutcome",
    }
}

/// Resource type bound to a canonical context key.
pub fn resource_type_for_key(key: &str) -> Option<FhircastResourceType> {
    FhircastResourceType::ALL
        .iter()
        .copied()
        .find(|resource_type| canonical_key_for(*resource_type) == key)
}
