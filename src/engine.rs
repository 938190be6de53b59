use crate::dataset::Dataset;
use crate::error::Partial;
use crate::rules::{RuleError, RuleInput, RuleSet};
use crate::script::{ScriptError, ScriptRuntime};
use crate::types::{Customer, Patient};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Applies a fixed set of rules with first-match-wins semantics.
///
/// Calls are serialized: the embedded runtime the rules execute in does not
/// support concurrent use, so concurrent callers wait for each other.
pub struct GenerationEngine {
	state: Mutex<EngineState>,
}

struct EngineState {
	rules: RuleSet,
	/// The runtime the rules were registered in, if any
	runtime: Option<ScriptRuntime>,
}

impl GenerationEngine {
	pub const fn new(rules: RuleSet) -> Self {
		Self {
			state: Mutex::new(EngineState {
				rules,
				runtime: None,
			}),
		}
	}

	/// Runs every rule script in `rules_dir` once and collects the rules they register.
	pub fn from_scripts(runtime: ScriptRuntime, rules_dir: &Path) -> Result<Self, ScriptError> {
		let scripts = runtime.load_dir(rules_dir)?;
		let rules = runtime.take_rules();
		info!(
			scripts,
			rules = rules.len(),
			dir = %rules_dir.display(),
			"Loaded worklist rules"
		);
		if rules.is_empty() {
			warn!("No rules registered, generated worklists will be empty");
		}

		Ok(Self {
			state: Mutex::new(EngineState {
				rules,
				runtime: Some(runtime),
			}),
		})
	}

	/// Generates the worklist dataset for a customer and patient.
	///
	/// Rules are tried in registration order and the first one that produces a
	/// dataset wins. Failing rules are skipped; their errors are returned together
	/// with the result. If no rule applies, the dataset is empty.
	pub fn generate(
		&self,
		customer: &Customer,
		patient: &Patient,
		template: &Dataset,
	) -> Partial<Dataset, RuleError> {
		let state = self.lock();
		let input = RuleInput {
			customer,
			patient,
			template,
		};

		let mut errors = Vec::new();
		for rule in state.rules.iter() {
			match rule.invoke(&input) {
				Ok(Some(dataset)) => {
					debug!(
						rule = rule.name(),
						elements = dataset.len(),
						"Rule produced worklist"
					);
					return Partial::new(dataset, errors);
				}
				Ok(None) => {}
				Err(source) => {
					warn!(rule = rule.name(), "Rule failed: {source}");
					errors.push(RuleError {
						rule: rule.name().to_owned(),
						source,
					});
				}
			}
		}

		debug!(patient = %patient.id, "No rule applied");
		Partial::new(Dataset::new(), errors)
	}

	/// Names of the loaded rules in registration order.
	pub fn rule_names(&self) -> Vec<String> {
		let state = self.lock();
		state.rules.names().into_iter().map(String::from).collect()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl std::fmt::Debug for GenerationEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.lock();
		f.debug_struct("GenerationEngine")
			.field("rules", &state.rules.names())
			.field("scripted", &state.runtime.is_some())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dictionary::TagResolver;
	use crate::error::BoxError;
	use crate::rules::FnRule;
	use dicom::core::header::Header;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dictionary_std::tags;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;
	use std::time::Duration;

	fn accession(number: &str) -> Dataset {
		[DataElement::new(
			tags::ACCESSION_NUMBER,
			VR::SH,
			PrimitiveValue::from(number),
		)]
		.into_iter()
		.collect()
	}

	fn generate(engine: &GenerationEngine) -> Partial<Dataset, RuleError> {
		engine.generate(&Customer::default(), &Patient::default(), &Dataset::new())
	}

	fn scripted(dir: &Path, timeout: Option<Duration>) -> GenerationEngine {
		let runtime = ScriptRuntime::new(Arc::new(TagResolver::new()), timeout).unwrap();
		GenerationEngine::from_scripts(runtime, dir).unwrap()
	}

	#[test]
	fn first_match_wins() {
		let mut rules = RuleSet::new();
		rules.push(FnRule::new("skip", |_: &RuleInput<'_>| Ok(None)));
		rules.push(FnRule::new("broken", |_: &RuleInput<'_>| {
			Err(BoxError::from("broken rule"))
		}));
		rules.push(FnRule::new("first", |_: &RuleInput<'_>| {
			Ok(Some(accession("A-1")))
		}));
		rules.push(FnRule::new("second", |_: &RuleInput<'_>| {
			Ok(Some(accession("A-2")))
		}));
		let engine = GenerationEngine::new(rules);

		let result = generate(&engine);
		assert_eq!(result.value, accession("A-1"));

		let error = result.error.unwrap();
		assert_eq!(error.len(), 1);
		assert_eq!(error.causes()[0].rule, "broken");
		assert!(error.to_string().contains("broken rule"));
	}

	#[test]
	fn no_match_yields_empty_dataset() {
		let mut rules = RuleSet::new();
		rules.push(FnRule::new("skip", |_: &RuleInput<'_>| Ok(None)));
		rules.push(FnRule::new("fail-1", |_: &RuleInput<'_>| {
			Err(BoxError::from("first failure"))
		}));
		rules.push(FnRule::new("fail-2", |_: &RuleInput<'_>| {
			Err(BoxError::from("second failure"))
		}));
		let engine = GenerationEngine::new(rules);

		let result = generate(&engine);
		assert!(result.value.is_empty());
		let rules: Vec<_> = result
			.error
			.unwrap()
			.into_causes()
			.into_iter()
			.map(|err| err.rule)
			.collect();
		assert_eq!(rules, vec!["fail-1", "fail-2"]);

		let result = generate(&GenerationEngine::new(RuleSet::new()));
		assert!(result.value.is_empty());
		assert!(result.is_complete());
	}

	#[test]
	fn invocations_are_serialized() {
		let active = Arc::new(AtomicUsize::new(0));
		let peak = Arc::new(AtomicUsize::new(0));

		let mut rules = RuleSet::new();
		let (rule_active, rule_peak) = (Arc::clone(&active), Arc::clone(&peak));
		rules.push(FnRule::new("slow", move |_: &RuleInput<'_>| {
			let now = rule_active.fetch_add(1, Ordering::SeqCst) + 1;
			rule_peak.fetch_max(now, Ordering::SeqCst);
			std::thread::sleep(Duration::from_millis(5));
			rule_active.fetch_sub(1, Ordering::SeqCst);
			Ok(Some(accession("A-1")))
		}));
		let engine = Arc::new(GenerationEngine::new(rules));

		let handles: Vec<_> = (0..8)
			.map(|_| {
				let engine = Arc::clone(&engine);
				std::thread::spawn(move || {
					for _ in 0..5 {
						assert_eq!(generate(&engine).value, accession("A-1"));
					}
				})
			})
			.collect();
		for handle in handles {
			handle.join().unwrap();
		}

		assert_eq!(peak.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn zero_rule_files_produce_empty_worklists() {
		let dir = tempfile::tempdir().unwrap();
		let engine = scripted(dir.path(), None);

		assert!(engine.rule_names().is_empty());
		assert!(format!("{engine:?}").contains("scripted: true"));
		let result = generate(&engine);
		assert!(result.value.is_empty());
		assert!(result.is_complete());
	}

	#[test]
	fn scripted_rule_uses_customer_name() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(
			dir.path().join("default.lua"),
			r#"rule("default", function(c, p, ds) return tag("PatientName", c.Name) end)"#,
		)
		.unwrap();
		let engine = scripted(dir.path(), None);

		let customer = Customer {
			id: String::from("C-7"),
			name: String::from("Muster^Max"),
			..Customer::default()
		};
		let result = engine.generate(&customer, &Patient::default(), &Dataset::new());
		assert!(result.is_complete());
		assert_eq!(result.value.len(), 1);

		let element = &result.value.elements()[0];
		assert_eq!(element.tag(), tags::PATIENT_NAME);
		assert_eq!(element.to_str().unwrap(), "Muster^Max");
	}

	#[test]
	fn rule_files_load_in_name_order() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(
			dir.path().join("20-fallback.lua"),
			r#"rule("fallback", function() return tag(Modality, "OT") end)"#,
		)
		.unwrap();
		std::fs::write(
			dir.path().join("10-ct.lua"),
			r#"
			rule("ct", function(c, p)
				if p.Sex ~= "F" then return nil end
				return tag(Modality, "CT")
			end)
			"#,
		)
		.unwrap();
		let engine = scripted(dir.path(), None);
		assert_eq!(engine.rule_names(), vec!["ct", "fallback"]);

		let female = Patient {
			sex: Some(String::from("F")),
			..Patient::default()
		};
		let modality = |patient: &Patient| {
			let result = engine.generate(&Customer::default(), patient, &Dataset::new());
			result.value.elements()[0].to_str().unwrap().trim_end().to_string()
		};
		assert_eq!(modality(&female), "CT");
		assert_eq!(modality(&Patient::default()), "OT");
	}

	#[test]
	fn hanging_rules_time_out() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(
			dir.path().join("rules.lua"),
			r#"
			rule("hang", function() while true do end end)
			rule("fallback", function() return tag(AccessionNumber, "A-1") end)
			"#,
		)
		.unwrap();
		let engine = scripted(dir.path(), Some(Duration::from_millis(50)));

		let result = generate(&engine);
		assert_eq!(result.value.len(), 1);
		let error = result.error.unwrap();
		assert_eq!(error.causes()[0].rule, "hang");
		assert!(matches!(
			error.causes()[0].source.downcast_ref::<ScriptError>(),
			Some(ScriptError::Timeout(_))
		));
	}

	#[test]
	fn broken_rule_files_fail_construction() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("broken.lua"), "rule(").unwrap();

		let runtime = ScriptRuntime::new(Arc::new(TagResolver::new()), None).unwrap();
		let err = GenerationEngine::from_scripts(runtime, dir.path()).unwrap_err();
		assert!(matches!(err, ScriptError::Compile { .. }));
	}
}
