//! Team members and the role/availability vocabulary the assignment engine
//! scores over.

use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Manager,
    Sales,
    Consultant,
    Pc,
    Builder,
    Tester,
}

impl Role {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Manager => "MANAGER",
            Role::Sales => "SALES",
            Role::Consultant => "CONSULTANT",
            Role::Pc => "PC",
            Role::Builder => "BUILDER",
            Role::Tester => "TESTER",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "ADMIN" => Some(Role::Admin),
            "MANAGER" => Some(Role::Manager),
            "SALES" => Some(Role::Sales),
            "CONSULTANT" => Some(Role::Consultant),
            "PC" => Some(Role::Pc),
            "BUILDER" => Some(Role::Builder),
            "TESTER" => Some(Role::Tester),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Availability {
    #[default]
    Available,
    Busy,
    OutOfOffice,
}

impl Availability {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Busy => "busy",
            Availability::OutOfOffice => "out_of_office",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Availability::Available),
            "busy" => Some(Availability::Busy),
            "out_of_office" | "ooo" | "leave" => Some(Availability::OutOfOffice),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub region: Option<String>,
    pub skills: Vec<String>,
    /// Maximum concurrent assignments; workload score is `1 - active/capacity`.
    pub capacity: i64,
    pub availability: Availability,
    pub performance_score: Option<f64>,
    pub active_assignments_count: i64,
    pub is_active: bool,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.active_assignments_count < self.capacity.max(1)
    }
}
