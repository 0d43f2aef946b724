//! Field-level validation for patient registration.
//!
//! Rules are declarative and evaluated in order; every violation is
//! collected rather than stopping at the first one.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{FieldValue, PatientFields};

/// A single validation failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Outcome of validating one set of fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    /// Convert into a `Result`, keeping all errors on failure.
    pub fn into_result(self) -> Result<(), Vec<FieldError>> {
        if self.is_valid {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Declarative rule for one field.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub field: &'static str,
    pub required: bool,
    pub pattern: Option<Regex>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub allowed: Option<Vec<&'static str>>,
    pub message: &'static str,
}

impl FieldRule {
    pub fn new(field: &'static str, message: &'static str) -> Self {
        Self {
            field,
            required: false,
            pattern: None,
            min: None,
            max: None,
            allowed: None,
            message,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn one_of(mut self, allowed: Vec<&'static str>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    /// Check the rule against a value; `None` means it passes.
    fn check(&self, value: &FieldValue<'_>) -> Option<FieldError> {
        let fail = || Some(FieldError::new(self.field, self.message));

        match value {
            FieldValue::Missing if self.required => Some(FieldError::new(
                self.field,
                format!("{} is required", self.field),
            )),
            FieldValue::Missing => None,
            FieldValue::Text(text) => {
                let text = text.trim();
                if let Some(pattern) = &self.pattern {
                    if !pattern.is_match(text) {
                        return fail();
                    }
                }
                if let Some(allowed) = &self.allowed {
                    if !allowed.iter().any(|a| a.eq_ignore_ascii_case(text)) {
                        return fail();
                    }
                }
                let len = text.chars().count() as f64;
                if self.pattern.is_none() && self.allowed.is_none() && self.out_of_range(len) {
                    return fail();
                }
                None
            }
            FieldValue::Number(n) => {
                if self.out_of_range(*n) {
                    fail()
                } else {
                    None
                }
            }
        }
    }

    fn out_of_range(&self, n: f64) -> bool {
        self.min.map(|min| n < min).unwrap_or(false) || self.max.map(|max| n > max).unwrap_or(false)
    }
}

/// Rule spanning more than one field.
#[derive(Clone)]
pub struct CrossFieldRule {
    pub name: &'static str,
    pub field: &'static str,
    pub message: &'static str,
    pub check: fn(&PatientFields) -> bool,
}

impl std::fmt::Debug for CrossFieldRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossFieldRule")
            .field("name", &self.name)
            .field("field", &self.field)
            .finish_non_exhaustive()
    }
}

/// Validation engine.
#[derive(Debug, Clone)]
pub struct Validator {
    rules: Vec<FieldRule>,
    cross_rules: Vec<CrossFieldRule>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::patient_defaults()
    }
}

impl Validator {
    /// Validator with no rules.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            cross_rules: Vec::new(),
        }
    }

    /// Standard rule set for patient registration.
    pub fn patient_defaults() -> Self {
        let name_pattern = Regex::new(r"^[\p{L}][\p{L}\p{M} .'-]{1,99}$").expect("valid regex");
        let phone_pattern = Regex::new(r"^[6-9][0-9]{9}$").expect("valid regex");

        let rules = vec![
            FieldRule::new(
                "name",
                "Name must be 2-100 letters (spaces, dots, apostrophes and hyphens allowed)",
            )
            .required()
            .pattern(name_pattern.clone()),
            FieldRule::new("guardian_name", "Guardian name must be 2-100 letters")
                .pattern(name_pattern),
            FieldRule::new("phone", "Phone must be a 10-digit mobile number starting with 6-9")
                .required()
                .pattern(phone_pattern),
            FieldRule::new("age", "Age must be between 0 and 120").range(0.0, 120.0),
            FieldRule::new("gender", "Gender must be Male, Female or Other")
                .one_of(vec!["Male", "Female", "Other"]),
            FieldRule::new("diagnosis", "Diagnosis must be at most 200 characters")
                .range(1.0, 200.0),
            FieldRule::new("phc", "Facility must be at most 50 characters")
                .required()
                .range(1.0, 50.0),
            FieldRule::new("systolic_bp", "Systolic pressure must be between 60 and 260 mmHg")
                .range(60.0, 260.0),
            FieldRule::new("diastolic_bp", "Diastolic pressure must be between 30 and 160 mmHg")
                .range(30.0, 160.0),
            FieldRule::new("notes", "Notes must be at most 1000 characters").range(0.0, 1000.0),
        ];

        let cross_rules = vec![CrossFieldRule {
            name: "systolic_above_diastolic",
            field: "systolic_bp",
            message: "Systolic pressure must be greater than diastolic pressure",
            check: |f| match (f.systolic_bp, f.diastolic_bp) {
                (Some(sys), Some(dia)) => sys > dia,
                _ => true,
            },
        }];

        Self { rules, cross_rules }
    }

    /// Add a field rule.
    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add a cross-field rule.
    pub fn with_cross_rule(mut self, rule: CrossFieldRule) -> Self {
        self.cross_rules.push(rule);
        self
    }

    /// Validate fields, collecting every violation.
    pub fn validate(&self, fields: &PatientFields) -> ValidationReport {
        let mut errors: Vec<FieldError> = self
            .rules
            .iter()
            .filter_map(|rule| rule.check(&fields.value_of(rule.field)))
            .collect();

        errors.extend(
            self.cross_rules
                .iter()
                .filter(|rule| !(rule.check)(fields))
                .map(|rule| FieldError::new(rule.field, rule.message)),
        );

        ValidationReport {
            is_valid: errors.is_empty(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn valid_fields() -> PatientFields {
        PatientFields {
            name: "Asha Devi".into(),
            guardian_name: Some("Ramesh Kumar".into()),
            phone: "9876543210".into(),
            age: Some(34),
            gender: Some("Female".into()),
            diagnosis: Some("Focal epilepsy".into()),
            phc: "PHC-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_patient() {
        let report = Validator::patient_defaults().validate(&valid_fields());
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_collects_all_violations() {
        let mut fields = valid_fields();
        fields.name = "".into();
        fields.phone = "12345".into();
        fields.age = Some(150);
        fields.gender = Some("Unknown".into());

        let report = Validator::patient_defaults().validate(&fields);
        assert!(!report.is_valid);

        let failed: Vec<&str> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(failed, vec!["name", "phone", "age", "gender"]);
        assert_eq!(report.errors[0].message, "name is required");
    }

    #[test]
    fn test_systolic_must_exceed_diastolic() {
        let mut fields = valid_fields();
        fields.systolic_bp = Some(80);
        fields.diastolic_bp = Some(90);

        let report = Validator::patient_defaults().validate(&fields);
        assert_eq!(
            report.errors,
            vec![FieldError::new(
                "systolic_bp",
                "Systolic pressure must be greater than diastolic pressure"
            )]
        );

        fields.systolic_bp = Some(120);
        fields.diastolic_bp = Some(80);
        assert!(Validator::patient_defaults().validate(&fields).is_valid);
    }

    #[test]
    fn test_indic_names_accepted() {
        let mut fields = valid_fields();
        fields.name = "आशा देवी".into();
        fields.guardian_name = Some("रमेश कुमार".into());
        let report = Validator::patient_defaults().validate(&fields);
        assert!(report.is_valid, "{:?}", report.errors);

        fields.name = "லட்சுமி".into();
        assert!(Validator::patient_defaults().validate(&fields).is_valid);

        // A combining mark cannot start a name.
        fields.name = "\u{093E}शा".into();
        assert!(!Validator::patient_defaults().validate(&fields).is_valid);
    }

    #[test]
    fn test_gender_case_insensitive() {
        let mut fields = valid_fields();
        fields.gender = Some("female".into());
        assert!(Validator::patient_defaults().validate(&fields).is_valid);
    }

    #[test]
    fn test_custom_rule() {
        let validator = Validator::empty().with_rule(
            FieldRule::new("village", "Village is required for field visits").required(),
        );
        let report = validator.validate(&valid_fields());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].field, "village");
        assert!(report.clone().into_result().is_err());
    }

    proptest! {
        #[test]
        fn prop_validation_is_deterministic(
            name in ".{0,20}",
            phone in "[0-9]{0,12}",
            age in proptest::option::of(0u32..200),
        ) {
            let mut fields = valid_fields();
            fields.name = name;
            fields.phone = phone;
            fields.age = age;

            let validator = Validator::patient_defaults();
            let first = validator.validate(&fields);
            let second = validator.validate(&fields);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.is_valid, first.errors.is_empty());
        }

        #[test]
        fn prop_valid_mobile_numbers_pass(phone in "[6-9][0-9]{9}") {
            let mut fields = valid_fields();
            fields.phone = phone;
            prop_assert!(Validator::patient_defaults().validate(&fields).is_valid);
        }
    }
}
