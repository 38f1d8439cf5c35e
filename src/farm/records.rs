//! Derived queries for the poll-only caches (tasks, ponds, fish, users,
//! samplings).

use chrono::{DateTime, Utc};

use super::types::{Fish, Pond, Sampling, Task, TaskStatus, User};
use crate::cache::EntityCache;

impl EntityCache<Task> {
  /// Open tasks whose due date has passed, most overdue first.
  pub fn overdue(&self, now: DateTime<Utc>) -> Vec<Task> {
    let mut tasks = self.filtered(|t| t.is_overdue(now));
    tasks.sort_by_key(|t| t.due_date);
    tasks
  }

  pub fn by_status(&self, status: TaskStatus) -> Vec<Task> {
    self.filtered(|t| t.status == status)
  }

  pub fn assigned_to(&self, user_id: &str) -> Vec<Task> {
    self.filtered(|t| t.assignee_id.as_deref() == Some(user_id))
  }

  pub fn for_pond(&self, pond_id: &str) -> Vec<Task> {
    self.filtered(|t| t.pond_id.as_deref() == Some(pond_id))
  }
}

impl EntityCache<Pond> {
  pub fn active(&self) -> Vec<Pond> {
    self.filtered(Pond::is_active)
  }

  /// Case-insensitive lookup by name.
  pub fn by_name(&self, name: &str) -> Option<Pond> {
    self.with_items(|items| {
      items
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
        .cloned()
    })
  }
}

impl EntityCache<Fish> {
  pub fn for_pond(&self, pond_id: &str) -> Vec<Fish> {
    self.filtered(|f| f.pond_id.as_deref() == Some(pond_id))
  }

  /// Total fish stocked in a pond across batches.
  pub fn stock_count(&self, pond_id: &str) -> i64 {
    self.with_items(|items| {
      items
        .iter()
        .filter(|f| f.pond_id.as_deref() == Some(pond_id))
        .map(|f| f.count)
        .sum()
    })
  }
}

impl EntityCache<User> {
  pub fn by_role(&self, role: &str) -> Vec<User> {
    self.filtered(|u| u.role.eq_ignore_ascii_case(role))
  }

  /// Name to show for a user id: name, then email, then the id itself.
  pub fn display_name(&self, user_id: &str) -> String {
    match self.get(user_id) {
      Some(user) if !user.name.is_empty() => user.name,
      Some(User { email: Some(email), .. }) => email,
      _ => user_id.to_string(),
    }
  }
}

impl EntityCache<Sampling> {
  /// Samplings of a pond, newest first.
  pub fn for_pond(&self, pond_id: &str) -> Vec<Sampling> {
    let mut samplings = self.filtered(|s| s.pond_id.as_deref() == Some(pond_id));
    samplings.sort_by(|a, b| b.sampled_at.cmp(&a.sampled_at));
    samplings
  }

  pub fn latest_for_pond(&self, pond_id: &str) -> Option<Sampling> {
    self.for_pond(pond_id).into_iter().next()
  }
}
