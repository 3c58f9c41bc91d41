//! Decide what should happen to a staff member's directory account, and suspend accounts of
//! staff that left.

use std::collections::BTreeSet;
use std::io::Write;

use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::{
    SchoolStaffRecord, StaffMember, StaffType,
    audit::AuditLog,
    config::DirectoryConfig,
    db::DBError,
    google::{AccountUpdate, Directory, GoogleApiError},
};

/// `schoolstaff.status` of an active assignment
const ACTIVE: i64 = 1;

/// What the directory account of a staff member should look like
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Enable {
        /// Every school code the staff member may access
        school_access: BTreeSet<String>,
        /// Only known when there is an active record at the home school
        staff_type: Option<StaffType>,
        /// The staff OU of the home school
        org_unit: String,
    },
    Suspend,
}

/// Result of the suspension of a single account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    Suspended,
    /// Suspensions are not applied in this run, nothing was changed
    WouldSuspend,
    AlreadySuspended,
    /// No account carries the DCID
    NotFound,
}

/// Processing of a single staff member failed. The sync continues with the next one.
#[derive(Debug)]
pub enum ProcessingError {
    Source(DBError),
    Directory(GoogleApiError),
    Audit(std::io::Error),
}
impl ProcessingError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Directory(e) => e.is_fatal(),
            Self::Source(_) | Self::Audit(_) => false,
        }
    }
}
impl core::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Source(x) => write!(f, "DBError: {x}"),
            Self::Directory(x) => write!(f, "GoogleApiError: {x}"),
            Self::Audit(x) => write!(f, "Cannot write the audit log: {x}"),
        }
    }
}
impl core::error::Error for ProcessingError {}
impl From<DBError> for ProcessingError {
    fn from(value: DBError) -> Self {
        Self::Source(value)
    }
}
impl From<GoogleApiError> for ProcessingError {
    fn from(value: GoogleApiError) -> Self {
        Self::Directory(value)
    }
}
impl From<std::io::Error> for ProcessingError {
    fn from(value: std::io::Error) -> Self {
        Self::Audit(value)
    }
}

/// Derive the decision for one staff member from their schoolstaff rows.
///
/// Rows that are not active are ignored. Any active row means the account stays enabled,
/// whatever its staff type code.
/// `home_org_unit` is the staff OU of the home school.
pub fn decide(
    staff: &StaffMember,
    records: &[SchoolStaffRecord],
    home_org_unit: &str,
) -> Decision {
    let active = records
        .iter()
        .filter(|record| record.status == ACTIVE)
        .collect::<Vec<_>>();
    if active.is_empty() {
        return Decision::Suspend;
    }

    let mut school_access = staff.explicit_access.clone();
    school_access.extend(active.iter().map(|record| record.school_id.to_string()));

    let staff_type = active
        .iter()
        .find(|record| record.school_id == staff.home_school)
        .and_then(|record| record.staff_status)
        .map(StaffType::from_code);
    if let Some(StaffType::Unknown(code)) = staff_type {
        warn!(
            "DCID {} has unknown staff type {code} at home school {}.",
            staff.dcid, staff.home_school
        );
    }

    Decision::Enable {
        school_access,
        staff_type,
        org_unit: home_org_unit.to_owned(),
    }
}

/// How suspensions are carried out
#[derive(Debug, Clone)]
pub struct SuspendPolicy {
    /// `<schema>.<field>` of the custom attribute holding the DCID
    pub cross_reference: String,
    /// Only report what would be suspended when false
    pub apply: bool,
    pub suspended_ou: Option<String>,
    pub frozen_ous: Vec<String>,
}
impl SuspendPolicy {
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self {
            cross_reference: format!(
                "{}.{}",
                config.cross_reference_schema, config.cross_reference_field
            ),
            apply: config.apply_suspensions,
            suspended_ou: config.suspended_ou.clone(),
            frozen_ous: config.frozen_ous.clone(),
        }
    }

    fn query_for(&self, dcid: i64) -> String {
        format!("{}={dcid}", self.cross_reference)
    }

    /// Accounts in a frozen OU, or below one, are never moved
    fn is_frozen(&self, org_unit_path: &str) -> bool {
        self.frozen_ous.iter().any(|frozen| {
            org_unit_path == frozen
                || org_unit_path
                    .strip_prefix(frozen.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// The update that suspends an account currently in `org_unit_path`
    fn update_for(&self, org_unit_path: &str) -> AccountUpdate {
        let org_unit_path = self
            .suspended_ou
            .as_ref()
            .filter(|target| target.as_str() != org_unit_path && !self.is_frozen(org_unit_path))
            .cloned();
        AccountUpdate {
            suspended: true,
            org_unit_path,
        }
    }
}

/// Find the account of a staff member that has no active school and suspend it.
///
/// The account is located by the DCID in its cross-reference attribute, not by email, since
/// the email in the SIS may be outdated.
pub async fn suspend<D: Directory, W: Write>(
    directory: &D,
    audit: &mut AuditLog<W>,
    staff: &StaffMember,
    policy: &SuspendPolicy,
) -> Result<SuspendOutcome, ProcessingError> {
    let dcid = staff.dcid;
    let email = &staff.email;
    let matches = directory.search(&policy.query_for(dcid)).await?;
    let Some(found) = matches.first() else {
        let line = format!(
            "Warning: Found inactive user DCID {dcid} without an account containing that {}. Should be {email}",
            policy.cross_reference
        );
        warn!("{line}");
        audit.record(&line)?;
        return Ok(SuspendOutcome::NotFound);
    };
    if matches.len() > 1 {
        warn!(
            "DCID {dcid} is set on multiple accounts: {}. Using {}.",
            matches.iter().map(|a| a.primary_email.as_str()).join(", "),
            found.primary_email
        );
    }

    // fetch again, the search result may be stale
    let account = directory.get(&found.primary_email).await?;
    if account.suspended {
        debug!("User with email {email} and DCID {dcid} is already suspended");
        return Ok(SuspendOutcome::AlreadySuspended);
    }

    if !policy.apply {
        let line = format!(
            "Would suspend {} with DCID {dcid} (suspensions are not applied)",
            account.primary_email
        );
        info!("{line}");
        audit.record(&line)?;
        return Ok(SuspendOutcome::WouldSuspend);
    }
    let line = format!("Suspending {} with DCID {dcid}", account.primary_email);
    info!("{line}");
    audit.record(&line)?;
    directory
        .update(&account.primary_email, &policy.update_for(&account.org_unit_path))
        .await?;
    Ok(SuspendOutcome::Suspended)
}
