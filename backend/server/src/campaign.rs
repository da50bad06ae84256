//! # Campaigns
//!
//! A campaign is created pending by its owner. A moderator approves or rejects it, and the
//! owner or a moderator can close it. Only approved campaigns before their deadline take
//! contributions.
//!
//! ```text
//! pending --(moderator)--> approved --(owner | moderator)--> closed
//!    |  \--(moderator)--> rejected
//!    \----(owner | moderator)--> closed
//! ```
use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use gateway::Amount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ledger::LedgerError, user::Caller};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    Approved,
    Rejected,
    Closed,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Pending => "pending",
            CampaignStatus::Approved => "approved",
            CampaignStatus::Rejected => "rejected",
            CampaignStatus::Closed => "closed",
        }
    }

    pub fn can_become(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;

        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Closed) | (Approved, Closed)
        )
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CampaignStatus::Pending),
            "approved" => Ok(CampaignStatus::Approved),
            "rejected" => Ok(CampaignStatus::Rejected),
            "closed" => Ok(CampaignStatus::Closed),
            other => Err(format!("unknown campaign status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: Uuid,
    pub owner: String,
    pub title: String,
    pub goal: Amount,
    pub raised: Amount,
    pub deadline: DateTime<Utc>,
    pub status: CampaignStatus,
    pub contributors: BTreeSet<String>,
    pub contributions_count: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(owner: &str, title: &str, goal: Amount, deadline: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            title: title.to_string(),
            goal,
            raised: Amount::ZERO,
            deadline,
            status: CampaignStatus::Pending,
            contributors: BTreeSet::new(),
            contributions_count: 0,
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn ensure_accepting(&self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.status != CampaignStatus::Approved || now >= self.deadline {
            return Err(LedgerError::NotAcceptingContributions(self.id));
        }

        Ok(())
    }

    pub fn check_transition(&self, next: CampaignStatus, caller: &Caller) -> Result<(), LedgerError> {
        if !self.status.can_become(next) {
            return Err(LedgerError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let allowed = match next {
            CampaignStatus::Closed => caller.is_moderator() || caller.id == self.owner,
            _ => caller.is_moderator(),
        };

        if !allowed {
            return Err(LedgerError::Forbidden);
        }

        Ok(())
    }

    /// Folds one succeeded contribution into the aggregate.
    pub(crate) fn apply(&mut self, contributor: &str, amount: Amount) -> Result<(), LedgerError> {
        self.raised = self
            .raised
            .checked_add(amount)
            .ok_or(LedgerError::Overflow(self.id))?;

        self.contributors.insert(contributor.to_string());
        self.contributions_count += 1;
        self.version += 1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use gateway::Amount;

    use super::{Campaign, CampaignStatus};
    use crate::{ledger::LedgerError, user::Caller};

    fn campaign() -> Campaign {
        Campaign::new(
            "owner",
            "Community kitchen",
            Amount::from_minor(10000),
            Utc::now() + Duration::days(30),
        )
    }

    #[test]
    fn test_new_campaign_is_pending_and_empty() {
        let campaign = campaign();

        assert_eq!(campaign.status, CampaignStatus::Pending);
        assert_eq!(campaign.raised, Amount::ZERO);
        assert!(campaign.contributors.is_empty());
        assert_eq!(campaign.contributions_count, 0);
    }

    #[test]
    fn test_only_approved_before_deadline_accepts() {
        let mut campaign = campaign();
        let now = Utc::now();

        assert!(matches!(
            campaign.ensure_accepting(now),
            Err(LedgerError::NotAcceptingContributions(_))
        ));

        campaign.status = CampaignStatus::Approved;
        assert!(campaign.ensure_accepting(now).is_ok());
        assert!(campaign.ensure_accepting(campaign.deadline).is_err());

        campaign.status = CampaignStatus::Closed;
        assert!(campaign.ensure_accepting(now).is_err());
    }

    #[test]
    fn test_moderator_transitions() {
        let campaign = campaign();
        let moderator = Caller::moderator("mod");
        let owner = Caller::member("owner");

        assert!(campaign.check_transition(CampaignStatus::Approved, &moderator).is_ok());
        assert!(campaign.check_transition(CampaignStatus::Rejected, &moderator).is_ok());
        assert!(matches!(
            campaign.check_transition(CampaignStatus::Approved, &owner),
            Err(LedgerError::Forbidden)
        ));
    }

    #[test]
    fn test_close_by_owner_or_moderator_only() {
        let mut campaign = campaign();
        campaign.status = CampaignStatus::Approved;

        assert!(campaign.check_transition(CampaignStatus::Closed, &Caller::member("owner")).is_ok());
        assert!(campaign.check_transition(CampaignStatus::Closed, &Caller::moderator("mod")).is_ok());
        assert!(matches!(
            campaign.check_transition(CampaignStatus::Closed, &Caller::member("stranger")),
            Err(LedgerError::Forbidden)
        ));
    }

    #[test]
    fn test_terminal_statuses() {
        let mut campaign = campaign();
        let moderator = Caller::moderator("mod");

        for terminal in [CampaignStatus::Rejected, CampaignStatus::Closed] {
            campaign.status = terminal;
            for next in [
                CampaignStatus::Pending,
                CampaignStatus::Approved,
                CampaignStatus::Rejected,
                CampaignStatus::Closed,
            ] {
                assert!(matches!(
                    campaign.check_transition(next, &moderator),
                    Err(LedgerError::InvalidTransition { .. })
                ));
            }
        }
    }

    #[test]
    fn test_apply_tracks_distinct_contributors() {
        let mut campaign = campaign();

        campaign.apply("u1", Amount::from_minor(2500)).unwrap();
        campaign.apply("u1", Amount::from_minor(1000)).unwrap();

        assert_eq!(campaign.raised, Amount::from_minor(3500));
        assert_eq!(campaign.contributions_count, 2);
        assert_eq!(campaign.contributors.len(), 1);
        assert_eq!(campaign.version, 2);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        assert_eq!("approved".parse::<CampaignStatus>(), Ok(CampaignStatus::Approved));
        assert!("archived".parse::<CampaignStatus>().is_err());
    }
}
