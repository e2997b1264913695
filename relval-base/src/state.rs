use crate::container::Container;
use crate::error::ValueError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// A discrete state: an optional integer code with an optional name. At
/// least one of the two must be present. Equality prefers the code and
/// falls back to the name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct State {
    code: Option<i32>,
    name: Option<String>,
}

impl State {
    pub fn new(code: Option<i32>, name: Option<impl Into<String>>) -> Result<Self, ValueError> {
        let name = name.map(Into::into);
        if code.is_none() && name.is_none() {
            return Err(ValueError::EmptyState);
        }
        Ok(Self { code, name })
    }

    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            name: None,
        }
    }

    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            code: None,
            name: Some(name.into()),
        }
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Container for State {
    fn is_frozen(&self) -> bool {
        true
    }

    fn freeze(&mut self) {}
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        match (self.code, other.code) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => match (&self.name, &other.name) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => false,
            },
        }
    }
}

impl fmt::Display for State {
    /// Canonical form is `"<code>:<name>"`; either side may be empty.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{code}:")?,
            None => write!(f, ":")?,
        }
        if let Some(name) = &self.name {
            write!(f, "{name}")?;
        }
        Ok(())
    }
}

impl FromStr for State {
    type Err = ValueError;

    /// Tolerates surrounding whitespace and a bare name preceded by `:`.
    /// Without a `:`, digits are taken as a code, anything else as a name.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let trimmed = text.trim();
        let error = || ValueError::Parse {
            kind: "state",
            text: text.to_string(),
        };
        match trimmed.split_once(':') {
            Some((code, name)) => {
                let code = match code.trim() {
                    "" => None,
                    digits => Some(digits.parse::<i32>().map_err(|_| error())?),
                };
                let name = match name.trim() {
                    "" => None,
                    name => Some(name.to_string()),
                };
                Self::new(code, name).map_err(|_| error())
            }
            None => match trimmed.parse::<i32>() {
                Ok(code) => Ok(Self::from_code(code)),
                Err(_) if !trimmed.is_empty() => Ok(Self::from_name(trimmed)),
                Err(_) => Err(error()),
            },
        }
    }
}

// ─── StateGroup ───────────────────────────────────────────────

/// A named collection of states, indexed by code and by upper-cased trimmed
/// name. Duplicate index entries are kept out, with a warning.
#[derive(Clone, Debug, Default)]
pub struct StateGroup {
    name: String,
    states: Vec<State>,
    by_code: BTreeMap<i32, usize>,
    by_name: BTreeMap<String, usize>,
}

impl StateGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, state: State) {
        let index = self.states.len();
        if let Some(code) = state.code() {
            if self.by_code.insert(code, index).is_some() {
                warn!("duplicate state code {} in group '{}'", code, self.name);
            }
        }
        if let Some(name) = state.name() {
            let key = name.trim().to_uppercase();
            if self.by_name.insert(key, index).is_some() {
                warn!("duplicate state name '{}' in group '{}'", name, self.name);
            }
        }
        self.states.push(state);
    }

    pub fn get_by_code(&self, code: i32) -> Option<&State> {
        self.by_code.get(&code).map(|&index| &self.states[index])
    }

    pub fn get_by_name(&self, name: &str) -> Option<&State> {
        self.by_name
            .get(&name.trim().to_uppercase())
            .map(|&index| &self.states[index])
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_round_trip() {
        let state = State::new(Some(7), Some("OPEN")).unwrap();
        assert_eq!(state.to_string(), "7:OPEN");
        let back: State = state.to_string().parse().unwrap();
        assert_eq!(back.code(), Some(7));
        assert_eq!(back.name(), Some("OPEN"));
    }

    #[test]
    fn tolerant_parsing() {
        let state: State = ":OPEN".parse().unwrap();
        assert_eq!(state.code(), None);
        assert_eq!(state.name(), Some("OPEN"));

        let state: State = "3:".parse().unwrap();
        assert_eq!(state.code(), Some(3));
        assert_eq!(state.name(), None);

        let state: State = "  5:HIGH  ".parse().unwrap();
        assert_eq!(state.code(), Some(5));
        assert_eq!(state.name(), Some("HIGH"));

        assert!(":".parse::<State>().is_err());
    }

    #[test]
    fn equality_prefers_code() {
        let a = State::new(Some(1), Some("ON")).unwrap();
        let b = State::new(Some(1), Some("OFF")).unwrap();
        let c = State::new(None, Some("ON")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn group_indexes_by_code_and_folded_name() {
        let mut group = StateGroup::new("switch");
        group.add(State::new(Some(0), Some("Off")).unwrap());
        group.add(State::new(Some(1), Some("On")).unwrap());

        assert_eq!(group.get_by_code(1).unwrap().name(), Some("On"));
        assert_eq!(group.get_by_name("  on ").unwrap().code(), Some(1));
        assert!(group.get_by_code(2).is_none());
    }
}
