//! Search parameter type dispatch (§4.6): token/string/date/reference, each
//! compiled to an [`FtsQuery`] by a plain function rather than dynamic
//! dispatch on resource type — an explicit lookup table in place of runtime
//! polymorphism.

use std::collections::HashMap;

use crate::error::CoreError;
use crate::gateway::{FtsQuery, MatchKind};

/// The four parameter kinds this engine understands. Any other kind is a
/// validation error at compile time (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchParamKind {
    Token,
    String,
    Date,
    Reference,
}

/// A single resource type's search parameter: its FTS-indexed path and kind.
#[derive(Debug, Clone)]
pub struct SearchParamDef {
    pub name: String,
    pub kind: SearchParamKind,
    pub path: String,
}

/// Type → search-parameter-name → definition, the explicit table search
/// compilation dispatches through (analogous to
/// `octofhir-search::registry::SearchParameterRegistry`, narrowed to the
/// four kinds supported here).
#[derive(Debug, Clone, Default)]
pub struct SearchParamRegistry {
    defs: HashMap<(String, String), SearchParamDef>,
}

impl SearchParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource_type: impl Into<String>, def: SearchParamDef) -> &mut Self {
        self.defs.insert((resource_type.into(), def.name.clone()), def);
        self
    }

    pub fn with(mut self, resource_type: impl Into<String>, def: SearchParamDef) -> Self {
        self.register(resource_type, def);
        self
    }

    pub fn get(&self, resource_type: &str, param: &str) -> Option<&SearchParamDef> {
        self.defs.get(&(resource_type.to_string(), param.to_string()))
    }
}

/// One `name=value` (optionally `name:modifier=value`) search criterion
/// after URL parsing (the REST surface's job — this crate receives the
/// already-split parameter name, modifier, and raw value).
#[derive(Debug, Clone)]
pub struct ParsedCriterion {
    pub param: String,
    pub modifier: Option<String>,
    /// Comma-separated values in the original query string are OR'd.
    pub values: Vec<String>,
}

/// A parsed `eq|ne|lt|le|gt|ge|sa|eb` date prefix plus the remaining date literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePrefix {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    StartsAfter,
    EndsBefore,
}

fn parse_date_prefix(raw: &str) -> (DatePrefix, &str) {
    const PREFIXES: &[(&str, DatePrefix)] = &[
        ("eq", DatePrefix::Eq),
        ("ne", DatePrefix::Ne),
        ("le", DatePrefix::Le),
        ("lt", DatePrefix::Lt),
        ("ge", DatePrefix::Ge),
        ("gt", DatePrefix::Gt),
        ("sa", DatePrefix::StartsAfter),
        ("eb", DatePrefix::EndsBefore),
    ];
    for (prefix, kind) in PREFIXES {
        if let Some(rest) = raw.strip_prefix(prefix) {
            return (*kind, rest);
        }
    }
    (DatePrefix::Eq, raw)
}

/// Compile one criterion into an FTS clause per its declared kind (§4.6).
/// Unknown parameters and unknown modifiers are validation errors.
pub fn compile_criterion(
    registry: &SearchParamRegistry,
    resource_type: &str,
    criterion: &ParsedCriterion,
) -> Result<FtsQuery, CoreError> {
    let def = registry.get(resource_type, &criterion.param).ok_or_else(|| {
        CoreError::validation(format!(
            "unknown search parameter {} on {resource_type}",
            criterion.param
        ))
    })?;

    let clauses: Result<Vec<FtsQuery>, CoreError> = criterion
        .values
        .iter()
        .map(|value| compile_value(def, criterion.modifier.as_deref(), value))
        .collect();
    Ok(FtsQuery::or(clauses?))
}

fn compile_value(
    def: &SearchParamDef,
    modifier: Option<&str>,
    raw_value: &str,
) -> Result<FtsQuery, CoreError> {
    match def.kind {
        SearchParamKind::Token => compile_token(def, raw_value),
        SearchParamKind::String => compile_string(def, modifier, raw_value),
        SearchParamKind::Date => compile_date(def, raw_value),
        SearchParamKind::Reference => compile_reference(def, raw_value),
    }
}

fn compile_token(def: &SearchParamDef, raw_value: &str) -> Result<FtsQuery, CoreError> {
    // `system|code`, `|code` (no system), or a bare code.
    if let Some((system, code)) = raw_value.split_once('|') {
        let mut clauses = Vec::new();
        if !system.is_empty() {
            clauses.push(FtsQuery::term(format!("{}.system", def.path), system, MatchKind::Exact));
        }
        if !code.is_empty() {
            clauses.push(FtsQuery::term(format!("{}.code", def.path), code, MatchKind::Exact));
        }
        Ok(FtsQuery::and(clauses))
    } else {
        Ok(FtsQuery::term(format!("{}.code", def.path), raw_value, MatchKind::Exact))
    }
}

fn compile_string(def: &SearchParamDef, modifier: Option<&str>, raw_value: &str) -> Result<FtsQuery, CoreError> {
    let kind = match modifier {
        None => MatchKind::Prefix,
        Some("exact") => MatchKind::Exact,
        Some("contains") => MatchKind::Contains,
        Some(other) => {
            return Err(CoreError::validation(format!(
                "unsupported string modifier :{other} on {}",
                def.name
            )))
        }
    };
    Ok(FtsQuery::term(def.path.clone(), raw_value, kind))
}

fn compile_date(def: &SearchParamDef, raw_value: &str) -> Result<FtsQuery, CoreError> {
    let (prefix, literal) = parse_date_prefix(raw_value);
    if literal.is_empty() {
        return Err(CoreError::validation(format!(
            "empty date literal for {}",
            def.name
        )));
    }
    let literal = literal.to_string();
    Ok(match prefix {
        DatePrefix::Eq => FtsQuery::DateRange {
            path: def.path.clone(),
            start: Some(literal.clone()),
            start_inclusive: true,
            end: Some(literal),
            end_inclusive: true,
        },
        DatePrefix::Ne => FtsQuery::DateRange {
            path: def.path.clone(),
            start: Some(literal.clone()),
            start_inclusive: false,
            end: Some(literal),
            end_inclusive: false,
        },
        DatePrefix::Lt | DatePrefix::EndsBefore => FtsQuery::DateRange {
            path: def.path.clone(),
            start: None,
            start_inclusive: false,
            end: Some(literal),
            end_inclusive: false,
        },
        DatePrefix::Le => FtsQuery::DateRange {
            path: def.path.clone(),
            start: None,
            start_inclusive: false,
            end: Some(literal),
            end_inclusive: true,
        },
        DatePrefix::Gt | DatePrefix::StartsAfter => FtsQuery::DateRange {
            path: def.path.clone(),
            start: Some(literal),
            start_inclusive: false,
            end: None,
            end_inclusive: false,
        },
        DatePrefix::Ge => FtsQuery::DateRange {
            path: def.path.clone(),
            start: Some(literal),
            start_inclusive: true,
            end: None,
            end_inclusive: false,
        },
    })
}

fn compile_reference(def: &SearchParamDef, raw_value: &str) -> Result<FtsQuery, CoreError> {
    // A bare `id` is ambiguous without a declared target type; a `Type/id`
    // shaped value is matched as a term against the stored reference string.
    Ok(FtsQuery::term(def.path.clone(), raw_value, MatchKind::Exact))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SearchParamRegistry {
        SearchParamRegistry::new()
            .with(
                "Patient",
                SearchParamDef {
                    name: "identifier".into(),
                    kind: SearchParamKind::Token,
                    path: "identifier".into(),
                },
            )
            .with(
                "Patient",
                SearchParamDef {
                    name: "name".into(),
                    kind: SearchParamKind::String,
                    path: "name.family".into(),
                },
            )
            .with(
                "Observation",
                SearchParamDef {
                    name: "date".into(),
                    kind: SearchParamKind::Date,
                    path: "effectiveDateTime".into(),
                },
            )
            .with(
                "Observation",
                SearchParamDef {
                    name: "patient".into(),
                    kind: SearchParamKind::Reference,
                    path: "subject.reference".into(),
                },
            )
    }

    #[test]
    fn token_with_system_and_code_ands_both() {
        let registry = registry();
        let criterion = ParsedCriterion {
            param: "identifier".into(),
            modifier: None,
            values: vec!["system|v1".into()],
        };
        let compiled = compile_criterion(&registry, "Patient", &criterion).unwrap();
        match compiled {
            FtsQuery::Conjunction(clauses) => assert_eq!(clauses.len(), 2),
            other => panic!("expected conjunction, got {other:?}"),
        }
    }

    #[test]
    fn unknown_parameter_is_validation_error() {
        let registry = registry();
        let criterion = ParsedCriterion {
            param: "bogus".into(),
            modifier: None,
            values: vec!["x".into()],
        };
        assert!(compile_criterion(&registry, "Patient", &criterion).is_err());
    }

    #[test]
    fn unknown_string_modifier_is_rejected() {
        let registry = registry();
        let criterion = ParsedCriterion {
            param: "name".into(),
            modifier: Some("fuzzy".into()),
            values: vec!["Smith".into()],
        };
        assert!(compile_criterion(&registry, "Patient", &criterion).is_err());
    }

    #[test]
    fn date_prefix_ge_builds_open_ended_start() {
        let registry = registry();
        let criterion = ParsedCriterion {
            param: "date".into(),
            modifier: None,
            values: vec!["ge2020-01-01".into()],
        };
        let compiled = compile_criterion(&registry, "Observation", &criterion).unwrap();
        match compiled {
            FtsQuery::DateRange { start, end, .. } => {
                assert_eq!(start.as_deref(), Some("2020-01-01"));
                assert_eq!(end, None);
            }
            other => panic!("expected date range, got {other:?}"),
        }
    }

    #[test]
    fn comma_separated_values_or_together() {
        let registry = registry();
        let criterion = ParsedCriterion {
            param: "patient".into(),
            modifier: None,
            values: vec!["Patient/1".into(), "Patient/2".into()],
        };
        let compiled = compile_criterion(&registry, "Observation", &criterion).unwrap();
        match compiled {
            FtsQuery::Disjunction(clauses) => assert_eq!(clauses.len(), 2),
            other => panic!("expected disjunction, got {other:?}"),
        }
    }
}
