//! Reference-valued element paths per resource type.
//!
//! Each entry names the dot path of a `Reference` element (arrays are traversed
//! transparently) and the resource types it may point at. `Resource` as a target
//! means any type. The same table doubles as the static reference graph: a
//! typed element of `A` can reference `B` if one of `A`'s paths lists `B`.
//!
//! Extensions carry untyped references on every resource type; they are listed
//! once in [`EXTENSION_PATHS`]. References inside `contained` resources have no
//! fixed path at all.

/// A reference element of a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencePath {
    pub path: &'static str,
    pub targets: &'static [&'static str],
}

impl ReferencePath {
    /// Returns true if this element may reference `resource_type`.
    pub fn may_target(&self, resource_type: &str) -> bool {
        self.targets
            .iter()
            .any(|t| *t == "Resource" || *t == resource_type)
    }
}

const fn p(path: &'static str, targets: &'static [&'static str]) -> ReferencePath {
    ReferencePath { path, targets }
}

const ANY: &[&str] = &["Resource"];
const SUBJECT: &[&str] = &["Patient", "Group"];
const PATIENT: &[&str] = &["Patient"];
const ORGANIZATION: &[&str] = &["Organization"];
const ENCOUNTER: &[&str] = &["Encounter"];
const LOCATION: &[&str] = &["Location"];
const ENDPOINT: &[&str] = &["Endpoint"];
const PEOPLE: &[&str] = &["Practitioner", "PractitionerRole", "Patient", "RelatedPerson"];
const PRACTITIONERS: &[&str] = &["Practitioner", "PractitionerRole", "Organization"];
const AGENTS: &[&str] = &[
    "Practitioner",
    "PractitionerRole",
    "Organization",
    "Patient",
    "RelatedPerson",
    "Device",
];
const CONDITIONS: &[&str] = &[
    "Condition",
    "Observation",
    "Procedure",
    "DiagnosticReport",
    "DocumentReference",
];
const REQUESTS: &[&str] = &[
    "CarePlan",
    "DeviceRequest",
    "ImmunizationRecommendation",
    "MedicationRequest",
    "NutritionOrder",
    "ServiceRequest",
];
const CONTEXT: &[&str] = &["Encounter", "EpisodeOfCare"];

/// Extension reference elements present on every resource type.
pub const EXTENSION_PATHS: &[ReferencePath] = &[
    p("extension.valueReference", ANY),
    p("modifierExtension.valueReference", ANY),
    p("meta.extension.valueReference", ANY),
];

static REGISTRY: &[(&str, &[ReferencePath])] = &[
    (
        "Account",
        &[
            p("subject", &[
                "Patient",
                "Device",
                "Practitioner",
                "PractitionerRole",
                "Location",
                "HealthcareService",
                "Organization",
            ]),
            p("owner", ORGANIZATION),
            p("guarantor.party", &["Patient", "RelatedPerson", "Organization"]),
        ],
    ),
    (
        "AllergyIntolerance",
        &[
            p("patient", PATIENT),
            p("encounter", ENCOUNTER),
            p("recorder", PEOPLE),
            p("asserter", PEOPLE),
        ],
    ),
    (
        "Appointment",
        &[
            p("participant.actor", &[
                "Patient",
                "Practitioner",
                "PractitionerRole",
                "RelatedPerson",
                "Device",
                "HealthcareService",
                "Location",
            ]),
            p("basedOn", &["ServiceRequest"]),
            p("reasonReference", CONDITIONS),
            p("slot", &["Slot"]),
            p("supportingInformation", ANY),
        ],
    ),
    (
        "AuditEvent",
        &[
            p("agent.who", AGENTS),
            p("entity.what", ANY),
            p("source.observer", AGENTS),
        ],
    ),
    (
        "CarePlan",
        &[
            p("subject", SUBJECT),
            p("encounter", ENCOUNTER),
            p("author", AGENTS),
            p("contributor", AGENTS),
            p("careTeam", &["CareTeam"]),
            p("addresses", &["Condition"]),
            p("goal", &["Goal"]),
            p("activity.reference", ANY),
            p("basedOn", &["CarePlan"]),
            p("replaces", &["CarePlan"]),
            p("partOf", &["CarePlan"]),
        ],
    ),
    (
        "CareTeam",
        &[
            p("subject", SUBJECT),
            p("encounter", ENCOUNTER),
            p("participant.member", &[
                "Practitioner",
                "PractitionerRole",
                "RelatedPerson",
                "Patient",
                "Organization",
                "CareTeam",
            ]),
            p("managingOrganization", ORGANIZATION),
        ],
    ),
    (
        "Communication",
        &[
            p("subject", SUBJECT),
            p("encounter", ENCOUNTER),
            p("sender", AGENTS),
            p("recipient", ANY),
            p("basedOn", ANY),
            p("partOf", ANY),
        ],
    ),
    (
        "Composition",
        &[
            p("subject", ANY),
            p("encounter", ENCOUNTER),
            p("author", AGENTS),
            p("custodian", ORGANIZATION),
            p("attester.party", AGENTS),
            p("section.entry", ANY),
            p("relatesTo.targetReference", &["Composition"]),
        ],
    ),
    (
        "Condition",
        &[
            p("subject", SUBJECT),
            p("encounter", ENCOUNTER),
            p("recorder", PEOPLE),
            p("asserter", PEOPLE),
            p("evidence.detail", ANY),
            p("stage.assessment", &["ClinicalImpression", "DiagnosticReport", "Observation"]),
        ],
    ),
    (
        "Consent",
        &[
            p("patient", PATIENT),
            p("performer", AGENTS),
            p("organization", ORGANIZATION),
            p("sourceReference", &[
                "Consent",
                "DocumentReference",
                "Contract",
                "QuestionnaireResponse",
            ]),
            p("provision.actor.reference", ANY),
        ],
    ),
    (
        "Coverage",
        &[
            p("policyHolder", &["Patient", "RelatedPerson", "Organization"]),
            p("subscriber", &["Patient", "RelatedPerson"]),
            p("beneficiary", PATIENT),
            p("payor", &["Organization", "Patient", "RelatedPerson"]),
        ],
    ),
    (
        "DiagnosticReport",
        &[
            p("subject", &["Patient", "Group", "Device", "Location"]),
            p("encounter", ENCOUNTER),
            p("performer", &["Practitioner", "PractitionerRole", "Organization", "CareTeam"]),
            p("resultsInterpreter", &["Practitioner", "PractitionerRole", "Organization", "CareTeam"]),
            p("result", &["Observation"]),
            p("specimen", &["Specimen"]),
            p("basedOn", REQUESTS),
            p("imagingStudy", &["ImagingStudy"]),
            p("media.link", &["Media"]),
        ],
    ),
    (
        "DocumentReference",
        &[
            p("subject", &["Patient", "Practitioner", "Group", "Device"]),
            p("author", AGENTS),
            p("authenticator", PRACTITIONERS),
            p("custodian", ORGANIZATION),
            p("context.encounter", CONTEXT),
            p("context.related", ANY),
            p("relatesTo.target", &["DocumentReference"]),
        ],
    ),
    (
        "Encounter",
        &[
            p("subject", SUBJECT),
            p("participant.individual", &["Practitioner", "PractitionerRole", "RelatedPerson"]),
            p("serviceProvider", ORGANIZATION),
            p("partOf", ENCOUNTER),
            p("episodeOfCare", &["EpisodeOfCare"]),
            p("basedOn", &["ServiceRequest"]),
            p("appointment", &["Appointment"]),
            p("reasonReference", CONDITIONS),
            p("diagnosis.condition", &["Condition", "Procedure"]),
            p("location.location", LOCATION),
            p("account", &["Account"]),
        ],
    ),
    (
        "ExplanationOfBenefit",
        &[
            p("patient", PATIENT),
            p("enterer", PEOPLE),
            p("provider", PRACTITIONERS),
            p("insurer", ORGANIZATION),
            p("claim", &["Claim"]),
            p("claimResponse", &["ClaimResponse"]),
            p("facility", LOCATION),
            p("careTeam.provider", PRACTITIONERS),
            p("insurance.coverage", &["Coverage"]),
            p("referral", &["ServiceRequest"]),
            p("prescription", &["MedicationRequest", "VisionPrescription"]),
        ],
    ),
    (
        "Goal",
        &[
            p("subject", &["Patient", "Group", "Organization"]),
            p("expressedBy", PEOPLE),
            p("addresses", &[
                "Condition",
                "Observation",
                "MedicationStatement",
                "NutritionOrder",
                "ServiceRequest",
                "RiskAssessment",
            ]),
        ],
    ),
    (
        "Group",
        &[
            p("member.entity", &[
                "Patient",
                "Practitioner",
                "PractitionerRole",
                "Device",
                "Medication",
                "Substance",
                "Group",
            ]),
            p("managingEntity", &["Organization", "RelatedPerson", "Practitioner", "PractitionerRole"]),
        ],
    ),
    (
        "Immunization",
        &[
            p("patient", PATIENT),
            p("encounter", ENCOUNTER),
            p("performer.actor", PRACTITIONERS),
            p("location", LOCATION),
            p("manufacturer", ORGANIZATION),
            p("reasonReference", &["Condition", "Observation", "DiagnosticReport"]),
        ],
    ),
    (
        "Location",
        &[
            p("managingOrganization", ORGANIZATION),
            p("partOf", LOCATION),
            p("endpoint", ENDPOINT),
        ],
    ),
    (
        "MedicationAdministration",
        &[
            p("subject", SUBJECT),
            p("context", CONTEXT),
            p("medicationReference", &["Medication"]),
            p("performer.actor", AGENTS),
            p("request", &["MedicationRequest"]),
            p("reasonReference", &["Condition", "Observation", "DiagnosticReport"]),
        ],
    ),
    (
        "MedicationDispense",
        &[
            p("subject", SUBJECT),
            p("context", CONTEXT),
            p("medicationReference", &["Medication"]),
            p("performer.actor", AGENTS),
            p("authorizingPrescription", &["MedicationRequest"]),
            p("receiver", &["Patient", "Practitioner"]),
        ],
    ),
    (
        "MedicationRequest",
        &[
            p("subject", SUBJECT),
            p("encounter", ENCOUNTER),
            p("requester", AGENTS),
            p("performer", AGENTS),
            p("recorder", &["Practitioner", "PractitionerRole"]),
            p("medicationReference", &["Medication"]),
            p("reasonReference", &["Condition", "Observation"]),
            p("basedOn", REQUESTS),
            p("insurance", &["Coverage", "ClaimResponse"]),
        ],
    ),
    (
        "MedicationStatement",
        &[
            p("subject", SUBJECT),
            p("context", CONTEXT),
            p("medicationReference", &["Medication"]),
            p("informationSource", PEOPLE),
            p("derivedFrom", ANY),
            p("basedOn", &["MedicationRequest", "CarePlan", "ServiceRequest"]),
            p("partOf", &[
                "MedicationAdministration",
                "MedicationDispense",
                "MedicationStatement",
                "Procedure",
                "Observation",
            ]),
            p("reasonReference", &["Condition", "Observation", "DiagnosticReport"]),
        ],
    ),
    (
        "Observation",
        &[
            p("subject", &["Patient", "Group", "Device", "Location"]),
            p("encounter", ENCOUNTER),
            p("performer", &[
                "Practitioner",
                "PractitionerRole",
                "Organization",
                "CareTeam",
                "Patient",
                "RelatedPerson",
            ]),
            p("basedOn", REQUESTS),
            p("partOf", &[
                "MedicationAdministration",
                "MedicationDispense",
                "MedicationStatement",
                "Procedure",
                "Immunization",
                "ImagingStudy",
            ]),
            p("hasMember", &["Observation", "QuestionnaireResponse", "MolecularSequence"]),
            p("derivedFrom", &[
                "DocumentReference",
                "ImagingStudy",
                "Media",
                "QuestionnaireResponse",
                "Observation",
                "MolecularSequence",
            ]),
            p("specimen", &["Specimen"]),
            p("device", &["Device", "DeviceMetric"]),
            p("focus", ANY),
        ],
    ),
    (
        "Organization",
        &[p("partOf", ORGANIZATION), p("endpoint", ENDPOINT)],
    ),
    (
        "Patient",
        &[
            p("generalPractitioner", PRACTITIONERS),
            p("managingOrganization", ORGANIZATION),
            p("link.other", &["Patient", "RelatedPerson"]),
        ],
    ),
    (
        "Person",
        &[
            p("link.target", &["Patient", "Practitioner", "RelatedPerson", "Person"]),
            p("managingOrganization", ORGANIZATION),
        ],
    ),
    (
        "Practitioner",
        &[p("qualification.issuer", ORGANIZATION)],
    ),
    (
        "PractitionerRole",
        &[
            p("practitioner", &["Practitioner"]),
            p("organization", ORGANIZATION),
            p("location", LOCATION),
            p("healthcareService", &["HealthcareService"]),
            p("endpoint", ENDPOINT),
        ],
    ),
    (
        "Procedure",
        &[
            p("subject", SUBJECT),
            p("encounter", ENCOUNTER),
            p("performer.actor", AGENTS),
            p("location", LOCATION),
            p("basedOn", &["CarePlan", "ServiceRequest"]),
            p("partOf", &["Procedure", "Observation", "MedicationAdministration"]),
            p("reasonReference", CONDITIONS),
            p("recorder", PEOPLE),
            p("asserter", PEOPLE),
        ],
    ),
    (
        "Provenance",
        &[
            p("target", ANY),
            p("agent.who", AGENTS),
            p("entity.what", ANY),
            p("location", LOCATION),
        ],
    ),
    (
        "QuestionnaireResponse",
        &[
            p("subject", ANY),
            p("encounter", ENCOUNTER),
            p("author", AGENTS),
            p("source", PEOPLE),
            p("basedOn", &["CarePlan", "ServiceRequest"]),
            p("partOf", &["Observation", "Procedure"]),
        ],
    ),
    (
        "RelatedPerson",
        &[p("patient", PATIENT)],
    ),
    (
        "ServiceRequest",
        &[
            p("subject", &["Patient", "Group", "Location", "Device"]),
            p("encounter", ENCOUNTER),
            p("requester", AGENTS),
            p("performer", ANY),
            p("basedOn", &["CarePlan", "ServiceRequest", "MedicationRequest"]),
            p("replaces", &["ServiceRequest"]),
            p("reasonReference", CONDITIONS),
            p("specimen", &["Specimen"]),
            p("insurance", &["Coverage", "ClaimResponse"]),
        ],
    ),
    (
        "Task",
        &[
            p("for", ANY),
            p("focus", ANY),
            p("encounter", ENCOUNTER),
            p("requester", AGENTS),
            p("owner", ANY),
            p("basedOn", ANY),
            p("partOf", &["Task"]),
        ],
    ),
];

/// Returns the registered reference paths of a resource type.
pub fn reference_paths(resource_type: &str) -> Option<&'static [ReferencePath]> {
    REGISTRY
        .iter()
        .find(|(name, _)| *name == resource_type)
        .map(|(_, paths)| *paths)
}
