//! Validation System - Rule/Policy Separation
//!
//! Rules produce structured violations.
//! Policy maps violations to actions by severity.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::BuildContext;
use crate::declaration::{Params, ValidateDecl};
use crate::error::{BuildError, Result};
use crate::expr::{Formula, Resolution};
use crate::node::{self, NodeKind};
use crate::scope::Evaluator;
use crate::tree::NodeId;
use crate::value::Value;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Aborts whatever operation ran the check.
    #[default]
    Error,
    Warning,
    /// Aborts only while a binary is being constructed.
    BuildError,
}

/// A declared `validate` formula. The node passes when it evaluates truthy.
#[derive(Debug, Clone)]
pub struct ValidationSpec {
    pub formula: Formula,
    pub message: Option<String>,
    pub severity: ViolationSeverity,
}

impl ValidationSpec {
    pub fn from_decl(decl: Option<&ValidateDecl>, node: &str) -> Result<Vec<Self>> {
        let Some(decl) = decl else {
            return Ok(Vec::new());
        };
        let (source, message, severity) = match decl {
            ValidateDecl::Formula(source) => (source, None, ViolationSeverity::Error),
            ValidateDecl::Full {
                calculate,
                message,
                severity,
            } => (calculate, message.clone(), *severity),
        };
        let formula = Formula::parse(source).map_err(|e| BuildError::parse(node, e.to_string()))?;
        Ok(vec![Self {
            formula,
            message,
            severity,
        }])
    }
}

/// Constraints declared through `params`.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub value_list: Vec<Value>,
    pub min: Option<Formula>,
    pub max: Option<Formula>,
    pub pattern: Option<Regex>,
}

impl Constraints {
    pub fn from_params(params: &Params, kind: &NodeKind, node: &str) -> Result<Self> {
        let bound = |scalar: &Option<crate::declaration::Scalar>| -> Result<Option<Formula>> {
            scalar
                .as_ref()
                .map(|s| Formula::parse(&s.to_formula()).map_err(|e| BuildError::parse(node, e.to_string())))
                .transpose()
        };
        let value_list = params
            .value_list
            .iter()
            .flatten()
            .map(|json| node::literal_for(kind, node, json))
            .collect::<Result<Vec<_>>>()?;
        let pattern = params
            .pattern
            .as_deref()
            .map(|p| Regex::new(&format!("^(?:{p})$")).map_err(|e| BuildError::parse(node, e.to_string())))
            .transpose()?;
        Ok(Self {
            value_list,
            min: bound(&params.value_min)?,
            max: bound(&params.value_max)?,
            pattern,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.value_list.is_empty() && self.min.is_none() && self.max.is_none() && self.pattern.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub path: String,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    #[serde(default)]
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn check(&self, ev: &Evaluator<'_>, id: NodeId, value: &Value) -> Result<Vec<ValidationViolation>>;
}

fn violation(rule: &str, ev: &Evaluator<'_>, id: NodeId, message: String) -> ValidationViolation {
    ValidationViolation {
        rule: rule.to_string(),
        severity: ViolationSeverity::Error,
        path: ev.tree().path_of(id),
        message,
        expected: None,
        actual: None,
        allowed: Vec::new(),
    }
}

// --- Concrete Rules ---

pub struct ValueListRule;

impl ValidationRule for ValueListRule {
    fn name(&self) -> &'static str {
        "value_list"
    }

    fn check(&self, ev: &Evaluator<'_>, id: NodeId, value: &Value) -> Result<Vec<ValidationViolation>> {
        let list = &ev.tree().node(id).constraints.value_list;
        if list.is_empty() || list.iter().any(|allowed| allowed.loosely_equals(value)) {
            return Ok(vec![]);
        }
        let allowed: Vec<String> = list.iter().map(ToString::to_string).collect();
        Ok(vec![ValidationViolation {
            actual: Some(value.to_string()),
            allowed,
            ..violation(self.name(), ev, id, format!("{value} is not an allowed value"))
        }])
    }
}

pub struct RangeRule;

impl ValidationRule for RangeRule {
    fn name(&self) -> &'static str {
        "range"
    }

    fn check(&self, ev: &Evaluator<'_>, id: NodeId, value: &Value) -> Result<Vec<ValidationViolation>> {
        let node = ev.tree().node(id);
        let mut out = vec![];
        let bounds = [(&node.constraints.min, "at least"), (&node.constraints.max, "at most")];
        for (bound, relation) in bounds {
            let Some(formula) = bound else { continue };
            let Resolution::Resolved(limit) = ev.formula(id, formula)? else {
                continue;
            };
            let ordering = value
                .compare(&limit)
                .map_err(|e| BuildError::convert(&node.name, e))?;
            let outside = match relation {
                "at least" => ordering.is_lt(),
                _ => ordering.is_gt(),
            };
            if outside {
                out.push(ValidationViolation {
                    expected: Some(format!("{relation} {limit}")),
                    actual: Some(value.to_string()),
                    ..violation(self.name(), ev, id, format!("{value} must be {relation} {limit}"))
                });
            }
        }
        Ok(out)
    }
}

pub struct PatternRule;

impl ValidationRule for PatternRule {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn check(&self, ev: &Evaluator<'_>, id: NodeId, value: &Value) -> Result<Vec<ValidationViolation>> {
        let Some(pattern) = &ev.tree().node(id).constraints.pattern else {
            return Ok(vec![]);
        };
        let text = match value {
            Value::Bytes(bytes) => hex::encode(bytes),
            other => other.to_string(),
        };
        if pattern.is_match(&text) {
            return Ok(vec![]);
        }
        Ok(vec![ValidationViolation {
            expected: Some(pattern.as_str().to_string()),
            actual: Some(text.clone()),
            ..violation(self.name(), ev, id, format!("{text:?} does not match the required pattern"))
        }])
    }
}

pub struct FormulaRule;

impl ValidationRule for FormulaRule {
    fn name(&self) -> &'static str {
        "formula"
    }

    fn check(&self, ev: &Evaluator<'_>, id: NodeId, _value: &Value) -> Result<Vec<ValidationViolation>> {
        let mut out = vec![];
        for spec in &ev.tree().node(id).validations {
            let Resolution::Resolved(outcome) = ev.formula(id, &spec.formula)? else {
                continue;
            };
            if !outcome.truthy() {
                let message = spec
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("validation {:?} failed", spec.formula.source()));
                out.push(ValidationViolation {
                    severity: spec.severity,
                    expected: Some(spec.formula.source().to_string()),
                    ..violation(self.name(), ev, id, message)
                });
            }
        }
        Ok(out)
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(ValueListRule),
                Box::new(RangeRule),
                Box::new(PatternRule),
                Box::new(FormulaRule),
            ],
        }
    }

    /// Violations for one node. Disabled nodes and values that cannot be
    /// resolved yet are not checked.
    pub fn validate_node(&self, ev: &Evaluator<'_>, id: NodeId) -> Result<Vec<ValidationViolation>> {
        let node = ev.tree().node(id);
        if node.constraints.is_empty() && node.validations.is_empty() {
            return Ok(vec![]);
        }
        if ev.enabled(id)? != Resolution::Resolved(true) {
            return Ok(vec![]);
        }
        let Resolution::Resolved(value) = ev.value(id)? else {
            return Ok(vec![]);
        };
        let mut violations = vec![];
        for rule in &self.rules {
            violations.extend(rule.check(ev, id, &value)?);
        }
        Ok(violations)
    }

    pub fn validate_tree(&self, ev: &Evaluator<'_>) -> Result<ValidationResult> {
        let tree = ev.tree();
        let mut violations = vec![];
        for id in tree.preorder(tree.root()) {
            violations.extend(self.validate_node(ev, id)?);
        }
        let mut result = ValidationResult {
            valid: false,
            violations,
        };
        result.valid = !result.has_errors();
        Ok(result)
    }

    /// Apply the severity policy: errors abort, warnings are logged, and
    /// build errors abort only while `building`.
    pub fn enforce(violations: &[ValidationViolation], ctx: &BuildContext, building: bool) -> Result<()> {
        for v in violations {
            let aborts = match v.severity {
                ViolationSeverity::Error => true,
                ViolationSeverity::BuildError => building && ctx.mode != crate::config::ToolMode::Edit,
                ViolationSeverity::Warning => false,
            };
            if aborts {
                return Err(BuildError::validate(&v.path, &v.message, v.allowed.clone()));
            }
            warn!(path = %v.path, rule = %v.rule, "{}", v.message);
        }
        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
