#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid character {0:?} in channel login")]
	InvalidChar(char),
	#[error("value too long ({0} chars)")]
	TooLong(usize),
}

/// Twitch logins are at most 25 characters.
pub const MAX_LOGIN_LEN: usize = 25;

/// Minecraft usernames are at most 16 characters; speedrun tooling allows a little slack.
pub const MAX_MC_NAME_LEN: usize = 32;

/// Normalized Twitch channel login (lowercase, no leading `#`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct ChannelLogin(String);

impl ChannelLogin {
	/// Normalize and validate a channel login.
	///
	/// Accepts IRC-style `#channel` as well as mixed case input.
	pub fn new(login: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let s = login.as_ref().trim();
		let s = s.strip_prefix('#').unwrap_or(s);
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let len = s.chars().count();
		if len > MAX_LOGIN_LEN {
			return Err(ParseIdError::TooLong(len));
		}

		let normalized = s.to_ascii_lowercase();
		if let Some(bad) = normalized
			.chars()
			.find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
		{
			return Err(ParseIdError::InvalidChar(bad));
		}

		Ok(Self(normalized))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelLogin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelLogin {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelLogin::new(s)
	}
}

impl TryFrom<String> for ChannelLogin {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelLogin::new(value)
	}
}

impl From<ChannelLogin> for String {
	fn from(v: ChannelLogin) -> Self {
		v.0
	}
}

impl AsRef<str> for ChannelLogin {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// Minecraft username linked to a channel. Case is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct McName(String);

impl McName {
	/// Create a trimmed, non-empty Minecraft name.
	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let s = name.as_ref().trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let len = s.chars().count();
		if len > MAX_MC_NAME_LEN {
			return Err(ParseIdError::TooLong(len));
		}
		Ok(Self(s.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for McName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn channel_login_normalizes() {
		let c = ChannelLogin::new("  #MobiusSpeedruns ").unwrap();
		assert_eq!(c.as_str(), "mobiusspeedruns");
		assert_eq!(c.to_string(), "mobiusspeedruns");
		assert_eq!("Foo_Bar9".parse::<ChannelLogin>().unwrap().as_str(), "foo_bar9");
	}

	#[test]
	fn rejects_bad_logins() {
		assert_eq!(ChannelLogin::new(""), Err(ParseIdError::Empty));
		assert_eq!(ChannelLogin::new("#"), Err(ParseIdError::Empty));
		assert_eq!(ChannelLogin::new("no spaces"), Err(ParseIdError::InvalidChar(' ')));
		assert_eq!(ChannelLogin::new("emoji-dash"), Err(ParseIdError::InvalidChar('-')));
		assert!(matches!(
			ChannelLogin::new("a".repeat(MAX_LOGIN_LEN + 1)),
			Err(ParseIdError::TooLong(_))
		));
	}

	#[test]
	fn mc_name_preserves_case() {
		let n = McName::new(" Inverted_Mobius ").unwrap();
		assert_eq!(n.as_str(), "Inverted_Mobius");
		assert!(McName::new("   ").is_err());
	}

	proptest! {
		#[test]
		fn normalization_is_idempotent(raw in "#?[A-Za-z0-9_]{1,25}") {
			let once = ChannelLogin::new(&raw).unwrap();
			let twice = ChannelLogin::new(once.as_str()).unwrap();
			prop_assert_eq!(&once, &twice);
			prop_assert_eq!(once.as_str(), once.as_str().to_ascii_lowercase());
		}

		#[test]
		fn hash_prefix_is_ignored(raw in "[a-z0-9_]{1,25}") {
			let plain = ChannelLogin::new(&raw).unwrap();
			let hashed = ChannelLogin::new(format!("#{raw}")).unwrap();
			prop_assert_eq!(plain, hashed);
		}
	}
}
