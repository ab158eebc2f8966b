//! Operation categories and name parsing with suggestions.

use color_eyre::{eyre::eyre, Report};
use std::fmt;
use std::str::FromStr;

use crate::events::EventType;

/// Coarse classification of a mutation, used to look up which resource keys it may stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationCategory {
  Student,
  Payment,
  Application,
  Settings,
  Room,
  All,
}

struct CategoryName {
  category: OperationCategory,
  name: &'static str,
  aliases: &'static [&'static str],
}

const NAMES: &[CategoryName] = &[
  CategoryName {
    category: OperationCategory::Student,
    name: "student",
    aliases: &["students"],
  },
  CategoryName {
    category: OperationCategory::Payment,
    name: "payment",
    aliases: &["payments"],
  },
  CategoryName {
    category: OperationCategory::Application,
    name: "application",
    aliases: &["applications"],
  },
  CategoryName {
    category: OperationCategory::Settings,
    name: "settings",
    aliases: &["setting"],
  },
  CategoryName {
    category: OperationCategory::Room,
    name: "room",
    aliases: &["rooms"],
  },
  CategoryName {
    category: OperationCategory::All,
    name: "all",
    aliases: &[],
  },
];

impl OperationCategory {
  pub const SPECIFIC: &'static [OperationCategory] = &[
    OperationCategory::Student,
    OperationCategory::Payment,
    OperationCategory::Application,
    OperationCategory::Settings,
    OperationCategory::Room,
  ];

  pub fn name(self) -> &'static str {
    match self {
      OperationCategory::Student => "student",
      OperationCategory::Payment => "payment",
      OperationCategory::Application => "application",
      OperationCategory::Settings => "settings",
      OperationCategory::Room => "room",
      OperationCategory::All => "all",
    }
  }

  /// Ranked suggestions for an unrecognized category name.
  pub fn suggest(input: &str) -> Vec<OperationCategory> {
    let input = input.trim().to_lowercase();
    if input.is_empty() {
      return NAMES.iter().map(|n| n.category).collect();
    }

    let mut matches: Vec<(OperationCategory, u32)> = NAMES
      .iter()
      .filter_map(|n| {
        let rank = if n.name == input {
          0
        } else if n.aliases.contains(&input.as_str()) {
          1
        } else if n.name.starts_with(&input) || input.starts_with(n.name) {
          2
        } else if n.aliases.iter().any(|a| a.starts_with(&input)) {
          3
        } else if n.name.contains(&input) {
          4
        } else {
          return None;
        };
        Some((n.category, rank))
      })
      .collect();

    matches.sort_by_key(|(_, rank)| *rank);
    matches.into_iter().map(|(c, _)| c).collect()
  }
}

impl fmt::Display for OperationCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for OperationCategory {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let input = s.trim().to_lowercase();
    NAMES
      .iter()
      .find(|n| n.name == input || n.aliases.contains(&input.as_str()))
      .map(|n| n.category)
      .ok_or_else(|| match OperationCategory::suggest(&input).first() {
        Some(hint) => eyre!("Unknown operation category '{}' (did you mean '{}'?)", s, hint),
        None => eyre!("Unknown operation category '{}'", s),
      })
  }
}

impl EventType {
  /// Category a remote tab should invalidate when it observes this event.
  pub fn category(self) -> OperationCategory {
    match self {
      EventType::StudentUpdated => OperationCategory::Student,
      EventType::PaymentUpdated => OperationCategory::Payment,
      EventType::ApplicationUpdated => OperationCategory::Application,
      EventType::SettingsUpdated => OperationCategory::Settings,
      EventType::RoomUpdated => OperationCategory::Room,
    }
  }
}
