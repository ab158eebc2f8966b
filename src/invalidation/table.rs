//! Category to resource-key table.

use color_eyre::{eyre::eyre, Result};

use super::category::OperationCategory;
use crate::resource::{Resource, CRITICAL};

const STUDENT: &[Resource] = &[
  Resource::Students,
  Resource::Dashboard,
  Resource::RecentActivities,
  Resource::Floors,
  Resource::Rooms,
  Resource::Payments,
  Resource::MonthlyRevenue,
  Resource::StudentProfile,
];

const PAYMENT: &[Resource] = &[
  Resource::Payments,
  Resource::Students,
  Resource::Dashboard,
  Resource::MonthlyRevenue,
  Resource::RecentActivities,
  Resource::StudentProfile,
];

const APPLICATION: &[Resource] = &[
  Resource::Applications,
  Resource::Students,
  Resource::Dashboard,
  Resource::RecentActivities,
  Resource::Floors,
  Resource::Rooms,
  Resource::Application,
];

const SETTINGS: &[Resource] = &[
  Resource::Settings,
  Resource::Dashboard,
  Resource::AdminProfile,
  Resource::Rules,
  Resource::Amenities,
];

const ROOM: &[Resource] = &[
  Resource::Rooms,
  Resource::Floors,
  Resource::Students,
  Resource::Dashboard,
  Resource::RecentActivities,
  Resource::StudentProfile,
];

/// Which cached resources each mutation category may have made stale.
///
/// `all` is derived as the first-seen-order union of the specific categories,
/// so it can never invalidate less than any of them.
#[derive(Debug, Clone)]
pub struct InvalidationTable {
  all: Vec<Resource>,
}

impl InvalidationTable {
  pub fn new() -> Self {
    let mut all: Vec<Resource> = Vec::new();
    for category in OperationCategory::SPECIFIC {
      for resource in Self::specific(*category) {
        if !all.contains(resource) {
          all.push(*resource);
        }
      }
    }
    Self { all }
  }

  fn specific(category: OperationCategory) -> &'static [Resource] {
    match category {
      OperationCategory::Student => STUDENT,
      OperationCategory::Payment => PAYMENT,
      OperationCategory::Application => APPLICATION,
      OperationCategory::Settings => SETTINGS,
      OperationCategory::Room => ROOM,
      OperationCategory::All => &[],
    }
  }

  /// Ordered resource keys affected by `category`.
  pub fn keys(&self, category: OperationCategory) -> &[Resource] {
    match category {
      OperationCategory::All => self.all.as_slice(),
      other => Self::specific(other),
    }
  }

  /// Keys of `category` that also belong to the critical set, in table order.
  pub fn critical_keys(&self, category: OperationCategory) -> Vec<Resource> {
    self
      .keys(category)
      .iter()
      .copied()
      .filter(|r| CRITICAL.contains(r))
      .collect()
  }

  /// Check the table invariants: no duplicates per category and `all` covers every category.
  pub fn validate(&self) -> Result<()> {
    for category in OperationCategory::SPECIFIC {
      let keys = self.keys(*category);
      for (i, resource) in keys.iter().enumerate() {
        if keys[..i].contains(resource) {
          return Err(eyre!("Category {} lists {} twice", category, resource));
        }
        if !self.all.contains(resource) {
          return Err(eyre!(
            "Category all is missing {} (required by {})",
            resource,
            category
          ));
        }
      }
    }
    Ok(())
  }
}

impl Default for InvalidationTable {
  fn default() -> Self {
    Self::new()
  }
}
