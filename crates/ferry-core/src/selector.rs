//! Label selectors used to pick eligible agents.

use crate::ids::SelectorId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    labels: BTreeSet<String>,
}

impl Selector {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn id(&self) -> SelectorId {
        SelectorId::from_sorted_labels(self.labels.iter().map(String::as_str))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        write!(f, "[{}]", labels.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ignores_order_and_duplicates() {
        let a = Selector::new(["linux", "docker"]);
        let b = Selector::new(["docker", "linux", "docker"]);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_id_differs_by_content() {
        assert_ne!(Selector::new(["ios"]).id(), Selector::new(["android"]).id());
        assert_ne!(Selector::default().id(), Selector::new(["ios"]).id());
    }
}
