//! The embedded Lua runtime that rule scripts execute in.
//!
//! Every rule script is compiled and run exactly once. While running, a script
//! registers its rules through the `rule(name, fn)` host function:
//!
//! ```lua
//! rule("default", function(customer, patient, template)
//!   return {
//!     tag(PatientName, patient.Name),
//!     tag("PatientID", patient.Id),
//!     tag(Modality, "CT"),
//!   }
//! end)
//! ```
//!
//! Besides `rule`, scripts can use `tag(name, value)` to create data elements,
//! `uid()` to generate a new unique identifier, `log(message)`, and a global
//! tag constant for every keyword of the tag dictionary.
//!
//! The `coroutine` library is not available to scripts. `pcall` and `xpcall`
//! cannot catch the error raised when an execution exceeds its time limit.
//!
//! The runtime is not safe for concurrent use. Its owner must serialize all
//! calls into it, including invocations of the registered rules.

mod rule;
mod userdata;

pub use rule::LuaRule;
pub use userdata::{LuaDataset, LuaElement, LuaTag};

use crate::codec::new_instance_uid;
use crate::dictionary::TagResolver;
use crate::rules::{Rule, RuleSet};
use mlua::{Function, HookTriggers, Lua, LuaOptions, StdLib, Value, VmState};
use rule::ExecutionClock;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// File extension of rule scripts.
pub const SCRIPT_EXTENSION: &str = "lua";

/// Number of VM instructions between two checks of the execution time limit.
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

const TIME_LIMIT_MESSAGE: &str = "execution time limit exceeded";

/// Replaces `pcall` and `xpcall` with versions that re-raise once the time limit
/// has been exceeded. Receives the `expired` check and the error message.
const PROTECTED_CALL_GUARD: &str = r#"
local pcall, xpcall, expired, limit = pcall, xpcall, ...
local function check(...)
	if expired() then
		error(limit, 0)
	end
	return ...
end
pcall = function(...) return check(pcall(...)) end
xpcall = function(...) return check(xpcall(...)) end
"#;

#[derive(Debug, Error)]
pub enum ScriptError {
	#[error("Failed to read rule script {path}: {source}")]
	Io {
		path: String,
		source: std::io::Error,
	},
	#[error("Failed to compile rule script {name}: {source}")]
	Compile { name: String, source: mlua::Error },
	#[error("Failed to run rule script {name}: {source}")]
	Run { name: String, source: mlua::Error },
	#[error("Script execution exceeded the time limit of {0:?}")]
	Timeout(Duration),
	#[error(transparent)]
	Lua(#[from] mlua::Error),
}

/// A compiled, not yet executed rule script.
pub struct CompiledProgram {
	name: String,
	function: Function,
}

impl CompiledProgram {
	pub fn name(&self) -> &str {
		&self.name
	}
}

pub struct ScriptRuntime {
	lua: Lua,
	resolver: Arc<TagResolver>,
	clock: ExecutionClock,
	timeout: Option<Duration>,
	/// Rules registered by scripts that have not been handed out yet
	registered: Arc<Mutex<Vec<LuaRule>>>,
}

impl ScriptRuntime {
	/// Creates a new runtime and binds the host functions and the tag constants of `resolver`.
	///
	/// A `timeout` limits every single script execution, including rule invocations.
	pub fn new(resolver: Arc<TagResolver>, timeout: Option<Duration>) -> Result<Self, ScriptError> {
		// Coroutines would run outside the reach of the time guard
		let lua = Lua::new_with(StdLib::ALL_SAFE ^ StdLib::COROUTINE, LuaOptions::default())?;
		let runtime = Self {
			lua,
			resolver,
			clock: ExecutionClock::default(),
			timeout,
			registered: Arc::new(Mutex::new(Vec::new())),
		};
		runtime.bind_constants()?;
		runtime.bind_host_functions()?;
		runtime.install_time_guard()?;
		Ok(runtime)
	}

	fn bind_constants(&self) -> Result<(), ScriptError> {
		let globals = self.lua.globals();
		for (keyword, tag) in self.resolver.keywords() {
			globals.set(keyword, LuaTag(tag))?;
		}
		debug!(constants = self.resolver.len(), "Bound tag constants");
		Ok(())
	}

	fn bind_host_functions(&self) -> Result<(), ScriptError> {
		let globals = self.lua.globals();

		let registered = Arc::clone(&self.registered);
		let resolver = Arc::clone(&self.resolver);
		let clock = self.clock.clone();
		let timeout = self.timeout;
		let rule = self
			.lua
			.create_function(move |lua, (name, callable): (String, Function)| {
				let key = lua.create_registry_value(callable)?;
				let mut registered = registered.lock().unwrap_or_else(PoisonError::into_inner);
				if registered.iter().any(|rule| rule.name() == name) {
					warn!(rule = %name, "Registered another rule with the same name");
				}
				debug!(rule = %name, "Registered rule");
				registered.push(LuaRule::new(
					name,
					key,
					lua.clone(),
					Arc::clone(&resolver),
					clock.clone(),
					timeout,
				));
				Ok(())
			})?;
		globals.set("rule", rule)?;

		let resolver = Arc::clone(&self.resolver);
		let tag = self
			.lua
			.create_function(move |_, (name, value): (Value, Value)| {
				let tag = userdata::tag_from_lua(&resolver, &name)?;
				let element = userdata::element_from_lua(&resolver, tag, value)?;
				Ok(LuaElement(element))
			})?;
		globals.set("tag", tag)?;

		let uid = self.lua.create_function(|_, ()| Ok(new_instance_uid()))?;
		globals.set("uid", uid)?;

		let log = self.lua.create_function(|_, message: String| {
			info!(source = "script", "{message}");
			Ok(())
		})?;
		globals.set("log", log)?;

		Ok(())
	}

	fn install_time_guard(&self) -> Result<(), ScriptError> {
		if self.timeout.is_none() {
			return Ok(());
		}
		let clock = self.clock.clone();
		self.lua.set_hook(
			HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
			move |_, _| {
				if clock.expired() {
					Err(mlua::Error::RuntimeError(String::from(TIME_LIMIT_MESSAGE)))
				} else {
					Ok(VmState::Continue)
				}
			},
		);

		let clock = self.clock.clone();
		let expired = self.lua.create_function(move |_, ()| Ok(clock.expired()))?;
		self.lua
			.load(PROTECTED_CALL_GUARD)
			.set_name("=guard")
			.call::<()>((expired, TIME_LIMIT_MESSAGE))?;
		Ok(())
	}

	pub fn compile(&self, name: &str, source: &str) -> Result<CompiledProgram, ScriptError> {
		let function = self
			.lua
			.load(source)
			.set_name(format!("@{name}"))
			.into_function()
			.map_err(|source| ScriptError::Compile {
				name: name.to_owned(),
				source,
			})?;

		Ok(CompiledProgram {
			name: name.to_owned(),
			function,
		})
	}

	pub fn run(&self, program: &CompiledProgram) -> Result<(), ScriptError> {
		let guard = self.clock.arm(self.timeout);
		match program.function.call::<()>(()) {
			Ok(()) => Ok(()),
			Err(_) if guard.expired() => Err(ScriptError::Timeout(guard.timeout())),
			Err(source) => Err(ScriptError::Run {
				name: program.name.clone(),
				source,
			}),
		}
	}

	/// Compiles and runs a single rule script.
	pub fn load_file(&self, path: &Path) -> Result<(), ScriptError> {
		let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
			path: path.display().to_string(),
			source,
		})?;
		let name = path.file_name().map_or_else(
			|| path.display().to_string(),
			|name| name.to_string_lossy().into_owned(),
		);

		let before = self.registered_len();
		let program = self.compile(&name, &source)?;
		self.run(&program)?;
		info!(
			script = %name,
			rules = self.registered_len() - before,
			"Loaded rule script"
		);
		Ok(())
	}

	/// Loads every rule script in `dir` and returns the number of scripts.
	pub fn load_dir(&self, dir: &Path) -> Result<usize, ScriptError> {
		let scripts = discover_scripts(dir)?;
		for script in &scripts {
			self.load_file(script)?;
		}
		Ok(scripts.len())
	}

	/// Hands out all rules registered so far, in registration order.
	pub fn take_rules(&self) -> RuleSet {
		let mut registered = self
			.registered
			.lock()
			.unwrap_or_else(PoisonError::into_inner);

		let mut rules = RuleSet::new();
		for rule in registered.drain(..) {
			rules.push(rule);
		}
		rules
	}

	fn registered_len(&self) -> usize {
		self.registered
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}
}

/// Lists the rule scripts in `dir`, sorted by file name.
///
/// Sorting makes rule precedence independent of the directory listing order of
/// the underlying filesystem.
pub fn discover_scripts(dir: &Path) -> Result<Vec<PathBuf>, ScriptError> {
	let io_error = |source| ScriptError::Io {
		path: dir.display().to_string(),
		source,
	};

	let mut scripts = Vec::new();
	for entry in std::fs::read_dir(dir).map_err(io_error)? {
		let path = entry.map_err(io_error)?.path();
		if path.is_file() && is_script(&path) {
			scripts.push(path);
		}
	}
	scripts.sort();
	Ok(scripts)
}

pub fn is_script(path: &Path) -> bool {
	path.extension()
		.is_some_and(|extension| extension == SCRIPT_EXTENSION)
}
