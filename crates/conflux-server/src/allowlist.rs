//! Codepoint allow-lists for names and user text.
//!
//! A list is a comma-separated mix of Unicode major-category wildcards
//! (`L*`, `M*`, `N*`, `P*`, `S*`, `Z*`, `C*`) and literal decimal
//! codepoints (`32`). Example: `L*,M*,N*,P*,32` allows letters, marks,
//! numbers, punctuation and the space character.

use unicode_general_category::{get_general_category, GeneralCategory};

use crate::error::RelayError;

/// The string categories an allow-list can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCategory {
    /// Client display names (handshake and set-name).
    ClientNames,
    /// Channel names.
    ChannelNames,
    /// Text payloads of messages addressed to the server.
    MessagesSentToServer,
    /// Text payloads of messages forwarded to clients.
    MessagesSentToClients,
}

impl TextCategory {
    /// Index into the server's allow-list table.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::ClientNames => 0,
            Self::ChannelNames => 1,
            Self::MessagesSentToServer => 2,
            Self::MessagesSentToClients => 3,
        }
    }
}

const GROUP_LETTER: u8 = 1 << 0;
const GROUP_MARK: u8 = 1 << 1;
const GROUP_NUMBER: u8 = 1 << 2;
const GROUP_PUNCTUATION: u8 = 1 << 3;
const GROUP_SYMBOL: u8 = 1 << 4;
const GROUP_SEPARATOR: u8 = 1 << 5;
const GROUP_OTHER: u8 = 1 << 6;

fn group_of(c: char) -> u8 {
    use GeneralCategory::*;
    match get_general_category(c) {
        UppercaseLetter | LowercaseLetter | TitlecaseLetter | ModifierLetter | OtherLetter => {
            GROUP_LETTER
        }
        NonspacingMark | SpacingMark | EnclosingMark => GROUP_MARK,
        DecimalNumber | LetterNumber | OtherNumber => GROUP_NUMBER,
        ConnectorPunctuation | DashPunctuation | OpenPunctuation | ClosePunctuation
        | InitialPunctuation | FinalPunctuation | OtherPunctuation => GROUP_PUNCTUATION,
        MathSymbol | CurrencySymbol | ModifierSymbol | OtherSymbol => GROUP_SYMBOL,
        SpaceSeparator | LineSeparator | ParagraphSeparator => GROUP_SEPARATOR,
        // Control, Format, Surrogate, PrivateUse, Unassigned
        _ => GROUP_OTHER,
    }
}

/// A parsed codepoint allow-list.
#[derive(Debug, Clone, Default)]
pub struct CodepointSet {
    groups: u8,
    literals: Vec<u32>,
}

impl CodepointSet {
    /// Parses an allow-list specification.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] on an empty specification or an
    /// unrecognized token.
    pub fn parse(spec: &str) -> Result<Self, RelayError> {
        let mut set = Self::default();
        let mut any = false;
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            any = true;
            match token {
                "L*" => set.groups |= GROUP_LETTER,
                "M*" => set.groups |= GROUP_MARK,
                "N*" => set.groups |= GROUP_NUMBER,
                "P*" => set.groups |= GROUP_PUNCTUATION,
                "S*" => set.groups |= GROUP_SYMBOL,
                "Z*" => set.groups |= GROUP_SEPARATOR,
                "C*" => set.groups |= GROUP_OTHER,
                literal => {
                    let cp: u32 = literal.parse().map_err(|_| {
                        RelayError::Config(format!("unrecognized allow-list token {token:?}"))
                    })?;
                    if char::from_u32(cp).is_none() {
                        return Err(RelayError::Config(format!(
                            "allow-list codepoint {cp} is not a valid scalar value"
                        )));
                    }
                    set.literals.push(cp);
                }
            }
        }
        if !any {
            return Err(RelayError::Config("empty allow-list specification".into()));
        }
        set.literals.sort_unstable();
        set.literals.dedup();
        Ok(set)
    }

    /// Whether a single codepoint is allowed.
    #[must_use]
    pub fn allows(&self, c: char) -> bool {
        self.groups & group_of(c) != 0 || self.literals.binary_search(&(c as u32)).is_ok()
    }

    /// Validates a whole string; returns the first offending character.
    ///
    /// # Errors
    ///
    /// Returns the first disallowed `char`.
    pub fn check(&self, s: &str) -> Result<(), char> {
        match s.chars().find(|&c| !self.allows(c)) {
            None => Ok(()),
            Some(c) => Err(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_names() -> CodepointSet {
        CodepointSet::parse("L*,M*,N*,P*,32").unwrap()
    }

    #[test]
    fn letters_numbers_punctuation_and_space_pass() {
        let set = default_names();
        assert!(set.check("frost-42, étude").is_ok());
    }

    #[test]
    fn control_characters_are_rejected() {
        let set = default_names();
        assert_eq!(set.check("hi\u{7}"), Err('\u{7}'));
    }

    #[test]
    fn symbols_rejected_without_symbol_group() {
        let set = default_names();
        assert_eq!(set.check("a+b"), Err('+'));
        let with_symbols = CodepointSet::parse("L*,S*").unwrap();
        assert!(with_symbols.check("a+b").is_ok());
    }

    #[test]
    fn literal_codepoints_allow_single_characters() {
        let set = CodepointSet::parse("L*,9731").unwrap();
        assert!(set.check("snow\u{2603}").is_ok());
        assert_eq!(set.check("snow "), Err(' '));
    }

    #[test]
    fn nonspacing_marks_pass_with_mark_group() {
        // e + combining acute accent
        let set = default_names();
        assert!(set.check("e\u{301}").is_ok());
    }

    #[test]
    fn empty_spec_is_config_error() {
        assert!(matches!(
            CodepointSet::parse("  , "),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn garbage_token_is_config_error() {
        assert!(matches!(
            CodepointSet::parse("L*,Q*"),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn surrogate_literal_is_config_error() {
        assert!(matches!(
            CodepointSet::parse("55296"),
            Err(RelayError::Config(_))
        ));
    }
}
