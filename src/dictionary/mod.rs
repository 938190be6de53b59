//! Keyword to tag resolution backed by the standard DICOM data dictionary.
//!
//! The set of keywords exposed to rule scripts is data: a built-in list that can be
//! extended with a keyword file. Both lookup directions are derived once, when the
//! resolver is created, and never change afterwards.

use dicom::core::{DataDictionary, Tag, VR};
use dicom::object::StandardDataDictionary;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

const BUILTIN_KEYWORDS: &str = include_str!("keywords.txt");

#[derive(Debug, Error)]
pub enum DictionaryError {
	#[error("Unknown DICOM tag '{0}'")]
	UnknownTag(String),
	#[error("Failed to read keyword list {path}: {source}")]
	Io {
		path: String,
		source: std::io::Error,
	},
}

/// Resolves DICOM keywords to tags and back.
#[derive(Debug)]
pub struct TagResolver {
	/// Keywords in load order
	keywords: Vec<(String, Tag)>,
	forward: HashMap<String, Tag>,
	reverse: HashMap<Tag, String>,
}

impl TagResolver {
	/// Creates a resolver for the built-in keyword list.
	pub fn new() -> Self {
		Self::from_keywords(parse_keywords(BUILTIN_KEYWORDS))
	}

	/// Creates a resolver for the built-in keyword list extended by the keywords in `path`.
	pub fn with_keyword_file(path: &Path) -> Result<Self, DictionaryError> {
		let extra = std::fs::read_to_string(path).map_err(|source| DictionaryError::Io {
			path: path.display().to_string(),
			source,
		})?;

		let keywords = parse_keywords(BUILTIN_KEYWORDS).chain(parse_keywords(&extra));
		Ok(Self::from_keywords(keywords))
	}

	/// Resolves every keyword against the standard dictionary.
	/// Keywords that cannot be resolved are skipped with a warning.
	pub fn from_keywords<'a>(keywords: impl IntoIterator<Item = &'a str>) -> Self {
		let mut resolver = Self {
			keywords: Vec::new(),
			forward: HashMap::new(),
			reverse: HashMap::new(),
		};

		for keyword in keywords {
			if resolver.forward.contains_key(keyword) {
				continue;
			}
			let Some(tag) = lookup_keyword(keyword) else {
				warn!(keyword, "Skipped unknown keyword in tag dictionary");
				continue;
			};

			match resolver.reverse.get(&tag) {
				Some(existing) => {
					warn!(
						keyword,
						alias_of = existing.as_str(),
						%tag,
						"Keyword is an alias of an already registered tag"
					);
				}
				None => {
					resolver.reverse.insert(tag, keyword.to_owned());
				}
			}
			resolver.forward.insert(keyword.to_owned(), tag);
			resolver.keywords.push((keyword.to_owned(), tag));
		}

		debug!(keywords = resolver.keywords.len(), "Loaded tag dictionary");
		resolver
	}

	/// Resolves a keyword or a tag written as `(gggg,eeee)`, `gggg,eeee` or `ggggeeee`.
	///
	/// Keywords outside the loaded list are looked up in the full standard dictionary.
	pub fn resolve(&self, name: &str) -> Result<Tag, DictionaryError> {
		let name = name.trim();
		if let Some(tag) = self.forward.get(name) {
			return Ok(*tag);
		}
		lookup_keyword(name)
			.or_else(|| parse_tag(name))
			.ok_or_else(|| DictionaryError::UnknownTag(name.to_owned()))
	}

	/// Returns the keyword registered for `tag`.
	pub fn keyword(&self, tag: Tag) -> Option<&str> {
		self.reverse.get(&tag).map(String::as_str)
	}

	/// Returns the value representation of `tag`, or `UN` for tags the standard does not define.
	pub fn vr(&self, tag: Tag) -> VR {
		StandardDataDictionary
			.by_tag(tag)
			.map_or(VR::UN, |entry| entry.vr.relaxed())
	}

	/// Iterates over all loaded keywords in load order.
	pub fn keywords(&self) -> impl Iterator<Item = (&str, Tag)> {
		self.keywords
			.iter()
			.map(|(keyword, tag)| (keyword.as_str(), *tag))
	}

	pub fn len(&self) -> usize {
		self.keywords.len()
	}

	pub fn is_empty(&self) -> bool {
		self.keywords.is_empty()
	}
}

impl Default for TagResolver {
	fn default() -> Self {
		Self::new()
	}
}

fn parse_keywords(text: &str) -> impl Iterator<Item = &str> {
	text.lines()
		.map(|line| line.split('#').next().unwrap_or_default().trim())
		.filter(|line| !line.is_empty())
}

fn lookup_keyword(keyword: &str) -> Option<Tag> {
	StandardDataDictionary
		.by_name(keyword)
		.map(|entry| entry.tag.inner())
}

fn parse_tag(text: &str) -> Option<Tag> {
	let text = text
		.strip_prefix('(')
		.and_then(|text| text.strip_suffix(')'))
		.unwrap_or(text);

	let (group, element) = match text.split_once(',') {
		Some((group, element)) => (group.trim(), element.trim()),
		None if text.len() == 8 && text.is_ascii() => text.split_at(4),
		None => return None,
	};
	if group.len() != 4 || element.len() != 4 {
		return None;
	}

	let group = u16::from_str_radix(group, 16).ok()?;
	let element = u16::from_str_radix(element, 16).ok()?;
	Some(Tag(group, element))
}
