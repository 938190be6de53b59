use super::userdata::{dataset_from_lua, LuaDataset};
use super::ScriptError;
use crate::dataset::Dataset;
use crate::dictionary::TagResolver;
use crate::error::BoxError;
use crate::rules::{Rule, RuleInput};
use mlua::{Function, Lua, LuaSerdeExt, RegistryKey, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A rule registered by a script through `rule(name, fn)`.
pub struct LuaRule {
	name: String,
	key: RegistryKey,
	lua: Lua,
	resolver: Arc<TagResolver>,
	clock: ExecutionClock,
	timeout: Option<Duration>,
}

impl LuaRule {
	pub(super) const fn new(
		name: String,
		key: RegistryKey,
		lua: Lua,
		resolver: Arc<TagResolver>,
		clock: ExecutionClock,
		timeout: Option<Duration>,
	) -> Self {
		Self {
			name,
			key,
			lua,
			resolver,
			clock,
			timeout,
		}
	}

	fn call(&self, input: &RuleInput<'_>) -> Result<Option<Dataset>, ScriptError> {
		let callable: Function = self.lua.registry_value(&self.key)?;
		let customer = self.lua.to_value(input.customer)?;
		let patient = self.lua.to_value(input.patient)?;
		let template = LuaDataset::new(input.template.clone(), Arc::clone(&self.resolver));

		let result: Value = callable.call((customer, patient, template))?;
		dataset_from_lua(result).map_err(ScriptError::from)
	}
}

impl Rule for LuaRule {
	fn name(&self) -> &str {
		&self.name
	}

	fn invoke(&self, input: &RuleInput<'_>) -> Result<Option<Dataset>, BoxError> {
		let guard = self.clock.arm(self.timeout);
		match self.call(input) {
			Ok(dataset) => Ok(dataset),
			Err(_) if guard.expired() => Err(Box::new(ScriptError::Timeout(guard.timeout()))),
			Err(err) => Err(Box::new(err)),
		}
	}
}

/// Deadline of the script execution in progress, checked by the instruction hook.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutionClock {
	deadline: Arc<Mutex<Option<Instant>>>,
}

impl ExecutionClock {
	/// Starts the clock. It is stopped again when the returned guard is dropped.
	pub fn arm(&self, timeout: Option<Duration>) -> ClockGuard<'_> {
		*self.lock() = timeout.map(|timeout| Instant::now() + timeout);
		ClockGuard {
			clock: self,
			timeout: timeout.unwrap_or_default(),
		}
	}

	pub fn expired(&self) -> bool {
		self.lock()
			.is_some_and(|deadline| Instant::now() >= deadline)
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
		self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

pub(crate) struct ClockGuard<'a> {
	clock: &'a ExecutionClock,
	timeout: Duration,
}

impl ClockGuard<'_> {
	pub fn expired(&self) -> bool {
		self.clock.expired()
	}

	pub const fn timeout(&self) -> Duration {
		self.timeout
	}
}

impl Drop for ClockGuard<'_> {
	fn drop(&mut self) {
		*self.clock.lock() = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clock_expires_after_the_timeout() {
		let clock = ExecutionClock::default();
		{
			let guard = clock.arm(Some(Duration::ZERO));
			assert!(guard.expired());
		}
		assert!(!clock.expired());

		let guard = clock.arm(Some(Duration::from_secs(60)));
		assert!(!guard.expired());
		drop(guard);

		let guard = clock.arm(None);
		assert!(!guard.expired());
	}
}
