//! Worklist rules and their registration-ordered collection.

use crate::dataset::Dataset;
use crate::error::BoxError;
use crate::types::{Customer, Patient};
use thiserror::Error;

/// The data a rule decides on.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
	pub customer: &'a Customer,
	pub patient: &'a Patient,
	pub template: &'a Dataset,
}

/// A named business rule that may produce a worklist dataset.
///
/// `Ok(None)` means the rule does not apply and the next rule is consulted.
pub trait Rule: Send + Sync {
	fn name(&self) -> &str;

	fn invoke(&self, input: &RuleInput<'_>) -> Result<Option<Dataset>, BoxError>;
}

/// A failed rule invocation, tagged with the rule name.
#[derive(Debug, Error)]
#[error("Rule '{rule}' failed: {source}")]
pub struct RuleError {
	pub rule: String,
	#[source]
	pub source: BoxError,
}

/// Rules in registration order. Registration order is the only precedence.
#[derive(Default)]
pub struct RuleSet {
	rules: Vec<Box<dyn Rule>>,
}

impl RuleSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, rule: impl Rule + 'static) {
		self.rules.push(Box::new(rule));
	}

	pub fn len(&self) -> usize {
		self.rules.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}

	pub fn names(&self) -> Vec<&str> {
		self.rules.iter().map(|rule| rule.name()).collect()
	}

	pub fn iter(&self) -> std::slice::Iter<'_, Box<dyn Rule>> {
		self.rules.iter()
	}
}

impl std::fmt::Debug for RuleSet {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_list().entries(self.names()).finish()
	}
}

/// A rule implemented by a Rust closure.
pub struct FnRule<F> {
	name: String,
	f: F,
}

impl<F> FnRule<F>
where
	F: Fn(&RuleInput<'_>) -> Result<Option<Dataset>, BoxError> + Send + Sync,
{
	pub fn new(name: impl Into<String>, f: F) -> Self {
		Self {
			name: name.into(),
			f,
		}
	}
}

impl<F> Rule for FnRule<F>
where
	F: Fn(&RuleInput<'_>) -> Result<Option<Dataset>, BoxError> + Send + Sync,
{
	fn name(&self) -> &str {
		&self.name
	}

	fn invoke(&self, input: &RuleInput<'_>) -> Result<Option<Dataset>, BoxError> {
		(self.f)(input)
	}
}
