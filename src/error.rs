use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

/// Boxed error used at the seams where the concrete failure type is not known.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Independent failures collected by a bulk operation that kept going.
#[derive(Debug)]
pub struct MultiError<E> {
	causes: Vec<E>,
}

impl<E> MultiError<E> {
	/// Returns `None` if there is nothing to report.
	pub fn from_causes(causes: Vec<E>) -> Option<Self> {
		if causes.is_empty() {
			None
		} else {
			Some(Self { causes })
		}
	}

	pub fn causes(&self) -> &[E] {
		&self.causes
	}

	pub fn len(&self) -> usize {
		self.causes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.causes.is_empty()
	}

	pub fn into_causes(self) -> Vec<E> {
		self.causes
	}
}

impl<E: Display> Display for MultiError<E> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self.causes.as_slice() {
			[cause] => write!(f, "1 error occurred: {cause}"),
			causes => {
				write!(f, "{} errors occurred:", causes.len())?;
				for cause in causes {
					write!(f, "\n\t* {cause}")?;
				}
				Ok(())
			}
		}
	}
}

impl<E: Debug + Display> Error for MultiError<E> {}

/// The outcome of a bulk operation: everything that succeeded, plus the
/// aggregated failures of the items that did not.
#[derive(Debug)]
pub struct Partial<T, E> {
	pub value: T,
	pub error: Option<MultiError<E>>,
}

impl<T, E> Partial<T, E> {
	pub fn new(value: T, causes: Vec<E>) -> Self {
		Self {
			value,
			error: MultiError::from_causes(causes),
		}
	}

	/// Returns true if no item failed.
	pub const fn is_complete(&self) -> bool {
		self.error.is_none()
	}

	/// Discards the partial value if any item failed.
	pub fn into_result(self) -> Result<T, MultiError<E>> {
		match self.error {
			None => Ok(self.value),
			Some(error) => Err(error),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_causes_are_not_an_error() {
		let partial: Partial<u8, String> = Partial::new(1, Vec::new());
		assert!(partial.is_complete());
		assert_eq!(partial.into_result().unwrap(), 1);
	}

	#[test]
	fn display_lists_every_cause() {
		let error = MultiError::from_causes(vec!["first", "second"]).unwrap();
		assert_eq!(
			error.to_string(),
			"2 errors occurred:\n\t* first\n\t* second"
		);

		let error = MultiError::from_causes(vec!["only"]).unwrap();
		assert_eq!(error.to_string(), "1 error occurred: only");
	}
}
