//! Resource keys: the independently fetchable views of backend data.

use color_eyre::{eyre::eyre, Report};
use std::fmt;
use std::str::FromStr;

/// A cached, independently fetchable view of backend data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
  Students,
  Dashboard,
  RecentActivities,
  Floors,
  Rooms,
  Payments,
  MonthlyRevenue,
  StudentProfile,
  Applications,
  Application,
  Settings,
  AdminProfile,
  Rules,
  Amenities,
}

/// Views users are most likely looking at right after a mutation.
/// These are refetched eagerly instead of waiting for the next read.
pub const CRITICAL: &[Resource] = &[Resource::Dashboard, Resource::Students, Resource::Payments];

impl Resource {
  pub const ALL: &'static [Resource] = &[
    Resource::Students,
    Resource::Dashboard,
    Resource::RecentActivities,
    Resource::Floors,
    Resource::Rooms,
    Resource::Payments,
    Resource::MonthlyRevenue,
    Resource::StudentProfile,
    Resource::Applications,
    Resource::Application,
    Resource::Settings,
    Resource::AdminProfile,
    Resource::Rules,
    Resource::Amenities,
  ];

  /// Cache key tag as used by the cache store and the backend views.
  pub fn as_str(self) -> &'static str {
    match self {
      Resource::Students => "students",
      Resource::Dashboard => "dashboard",
      Resource::RecentActivities => "recentActivities",
      Resource::Floors => "floors",
      Resource::Rooms => "rooms",
      Resource::Payments => "payments",
      Resource::MonthlyRevenue => "monthlyRevenue",
      Resource::StudentProfile => "studentProfile",
      Resource::Applications => "applications",
      Resource::Application => "application",
      Resource::Settings => "settings",
      Resource::AdminProfile => "adminProfile",
      Resource::Rules => "rules",
      Resource::Amenities => "amenities",
    }
  }

  /// Default REST path for fetching this resource, relative to the API base.
  pub fn default_endpoint(self) -> &'static str {
    match self {
      Resource::Students => "students/",
      Resource::Dashboard => "dashboard/",
      Resource::RecentActivities => "recent-activities/",
      Resource::Floors => "floors/",
      Resource::Rooms => "rooms/",
      Resource::Payments => "payments/",
      Resource::MonthlyRevenue => "monthly-revenue/",
      Resource::StudentProfile => "student-profile/",
      Resource::Applications => "applications/",
      Resource::Application => "application/",
      Resource::Settings => "settings/",
      Resource::AdminProfile => "admin-profile/",
      Resource::Rules => "rules/",
      Resource::Amenities => "amenities/",
    }
  }

  pub fn is_critical(self) -> bool {
    CRITICAL.contains(&self)
  }
}

impl fmt::Display for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Resource {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Resource::ALL
      .iter()
      .copied()
      .find(|r| r.as_str() == s)
      .ok_or_else(|| eyre!("Unknown resource key: {}", s))
  }
}
