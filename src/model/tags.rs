//! Manual and automatic tags (§3 "Tag").

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A tag whose membership is an explicit, user-maintained set of mod-ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualTag {
    pub name: String,
    pub mod_ids: HashSet<u64>,
}

/// A boolean expression over per-mod predicates, evaluated against a
/// mod's name and the relative paths of files it contains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AutoTagExpression {
    NameContains(String),
    HasFileExtension(String),
    HasFileNamed(String),
    And(Box<AutoTagExpression>, Box<AutoTagExpression>),
    Or(Box<AutoTagExpression>, Box<AutoTagExpression>),
    Not(Box<AutoTagExpression>),
}

/// What an automatic tag evaluator needs to know about one mod to decide
/// membership: its display name and a listing of its relative file paths
/// (cached per mod by the controller for a batch re-evaluation, §4.9
/// "using a cached file-listing per mod for efficiency").
pub struct ModFacts<'a> {
    pub name: &'a str,
    pub files: &'a [String],
}

impl AutoTagExpression {
    pub fn evaluate(&self, facts: &ModFacts<'_>) -> bool {
        match self {
            AutoTagExpression::NameContains(needle) => facts
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            AutoTagExpression::HasFileExtension(ext) => facts.files.iter().any(|f| {
                f.rsplit('.')
                    .next()
                    .map(|e| e.eq_ignore_ascii_case(ext))
                    .unwrap_or(false)
            }),
            AutoTagExpression::HasFileNamed(name) => facts.files.iter().any(|f| {
                f.rsplit('/')
                    .next()
                    .map(|n| n.eq_ignore_ascii_case(name))
                    .unwrap_or(false)
            }),
            AutoTagExpression::And(a, b) => a.evaluate(facts) && b.evaluate(facts),
            AutoTagExpression::Or(a, b) => a.evaluate(facts) || b.evaluate(facts),
            AutoTagExpression::Not(a) => !a.evaluate(facts),
        }
    }
}

/// An automatic tag: a name plus the expression that decides membership.
/// The "change_evaluator" controller action replaces `expression` and
/// triggers a full re-evaluation over every installed mod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTag {
    pub name: String,
    pub expression: AutoTagExpression,
    pub mod_ids: HashSet<u64>,
}

/// Either kind of tag, for APIs that operate on tags generically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Tag {
    Manual(ManualTag),
    Auto(AutoTag),
}

impl Tag {
    pub fn name(&self) -> &str {
        match self {
            Tag::Manual(t) => &t.name,
            Tag::Auto(t) => &t.name,
        }
    }

    pub fn mod_ids(&self) -> &HashSet<u64> {
        match self {
            Tag::Manual(t) => &t.mod_ids,
            Tag::Auto(t) => &t.mod_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_and_or_not_compose() {
        let facts = ModFacts {
            name: "Unofficial Skyrim Patch",
            files: &["Meshes/armor.nif".to_string(), "Scripts/foo.pex".to_string()],
        };

        let expr = AutoTagExpression::And(
            Box::new(AutoTagExpression::NameContains("patch".into())),
            Box::new(AutoTagExpression::Not(Box::new(
                AutoTagExpression::HasFileExtension("esp".into()),
            ))),
        );
        assert!(expr.evaluate(&facts));
    }

    #[test]
    fn has_file_named_matches_basename_case_insensitively() {
        let facts = ModFacts {
            name: "Foo",
            files: &["Data/Scripts/MAIN.PEX".to_string()],
        };
        assert!(AutoTagExpression::HasFileNamed("main.pex".into()).evaluate(&facts));
    }
}
