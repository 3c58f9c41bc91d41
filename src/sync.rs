//! One pass over all schools and their staff.

use std::collections::BTreeSet;
use std::io::Write;

use itertools::Itertools;
use tracing::{debug, error, info, trace, warn};

use crate::{
    InShutdown, School, StaffMember, StaffType, SyncError,
    audit::AuditLog,
    config::Config,
    db::{SisSource, SourceStore},
    google::{Directory, GoogleDirectory},
    reconcile::{Decision, ProcessingError, SuspendOutcome, SuspendPolicy, decide, suspend},
};

/// The sessions a run holds from start to end
pub(crate) struct RunContext<S, D, W: Write> {
    pub source: S,
    pub directory: D,
    pub audit: AuditLog<W>,
}

impl RunContext<SisSource, GoogleDirectory, std::io::BufWriter<std::fs::File>> {
    /// Authenticate against the directory, connect to the SIS and create the audit log.
    pub async fn open(config: &Config) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(crate::google::GoogleApiError::CannotCreateClient)?;
        let access_token = crate::oauth::access_token(
            &http,
            &config.directory.credentials_file,
            &config.directory.token_file,
        )
        .await?;
        let directory = GoogleDirectory::new(
            crate::google::create_client(&access_token)?,
            &config.directory.api_base,
            &config.directory.domain,
            &config.directory.customer,
        );
        info!("Got a directory token.");

        let source = SisSource::connect(&config.source).await?;
        info!("Connected to the SIS database as {}.", config.source.username);

        let audit = AuditLog::create(&config.global.audit_log).map_err(SyncError::Audit)?;
        Ok(Self {
            source,
            directory,
            audit,
        })
    }

    pub async fn close(mut self) {
        self.source.close().await;
        if let Err(e) = self.audit.flush() {
            error!("Failed to flush the audit log: {e}");
        }
    }
}

/// Wait for `fut`, unless a shutdown is requested first.
///
/// For the setup steps before the pass, which may wait on the network or on the user.
pub async fn interruptible<T>(
    fut: impl Future<Output = Result<T, SyncError>>,
    watcher: &tokio::sync::watch::Receiver<InShutdown>,
) -> Result<T, SyncError> {
    let mut watcher = watcher.clone();
    if matches!(*watcher.borrow_and_update(), InShutdown::Yes) {
        return Err(SyncError::Interrupted);
    }
    tokio::select! {
        res = fut => res,
        Ok(()) = watcher.changed() => Err(SyncError::Interrupted),
    }
}

/// Settings of a pass, taken from the config
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub staff_ou_root: String,
    pub policy: SuspendPolicy,
}

/// What happened to one staff member
#[derive(Debug, Clone, PartialEq)]
pub enum StaffOutcome {
    Enabled {
        school_access: BTreeSet<String>,
        staff_type: Option<StaffType>,
        org_unit: String,
    },
    Suspend(SuspendOutcome),
}

#[derive(Debug)]
pub struct StaffResult {
    /// `None` only when the users row itself was unreadable
    pub dcid: Option<i64>,
    pub email: Option<String>,
    pub outcome: Result<StaffOutcome, ProcessingError>,
}

/// Everything a pass did
#[derive(Debug, Default)]
pub struct RunReport {
    pub schools: usize,
    pub results: Vec<StaffResult>,
    /// A shutdown signal stopped the pass early
    pub interrupted: bool,
}
impl RunReport {
    fn count(&self, pred: impl Fn(&StaffOutcome) -> bool) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.as_ref().is_ok_and(&pred))
            .count()
    }

    pub fn enabled(&self) -> usize {
        self.count(|o| matches!(o, StaffOutcome::Enabled { .. }))
    }

    pub fn suspend_outcomes(&self, outcome: SuspendOutcome) -> usize {
        self.count(|o| *o == StaffOutcome::Suspend(outcome))
    }

    pub fn errors(&self) -> impl Iterator<Item = &StaffResult> {
        self.results.iter().filter(|r| r.outcome.is_err())
    }

    pub fn log_summary(&self) {
        info!(
            "Processed {} staff members in {} schools: {} enabled, {} suspended, {} to suspend, {} already suspended, {} not found, {} errors.",
            self.results.len(),
            self.schools,
            self.enabled(),
            self.suspend_outcomes(SuspendOutcome::Suspended),
            self.suspend_outcomes(SuspendOutcome::WouldSuspend),
            self.suspend_outcomes(SuspendOutcome::AlreadySuspended),
            self.suspend_outcomes(SuspendOutcome::NotFound),
            self.errors().count(),
        );
        for failed in self.errors() {
            if let Err(e) = &failed.outcome {
                warn!(
                    "Failed: DCID {} ({}): {e}",
                    failed.dcid.map_or("?".to_string(), |d| d.to_string()),
                    failed.email.as_deref().unwrap_or("?")
                );
            }
        }
        if self.interrupted {
            warn!("The run was interrupted, not all staff members were processed.");
        }
    }
}

/// Reconcile a single staff member
async fn process_staff<S: SourceStore, D: Directory, W: Write>(
    ctx: &mut RunContext<S, D, W>,
    school: &School,
    staff: &StaffMember,
    settings: &SyncSettings,
) -> Result<StaffOutcome, ProcessingError> {
    trace!(
        "Processing {} {} <{}>, teacher number {:?}, security group {:?}, access {}",
        staff.first_name,
        staff.last_name,
        staff.email,
        staff.teacher_number,
        staff.security_group,
        staff.explicit_access.iter().join(";")
    );
    let records = ctx.source.active_school_staff(staff.dcid).await?;
    for record in &records {
        trace!(
            "DCID {} at school {}: status {}, staff type {:?}, cell {:?}",
            staff.dcid, record.school_id, record.status, record.staff_status, record.cell_phone
        );
    }
    let home_org_unit = school.staff_org_unit(&settings.staff_ou_root);
    match decide(staff, &records, &home_org_unit) {
        Decision::Enable {
            school_access,
            staff_type,
            org_unit,
        } => {
            debug!(
                "{} stays enabled in {org_unit} with access to {} as {}",
                staff.email,
                school_access.iter().join(";"),
                staff_type.map_or("(no type at home school)".to_string(), |t| t.to_string())
            );
            Ok(StaffOutcome::Enabled {
                school_access,
                staff_type,
                org_unit,
            })
        }
        Decision::Suspend => {
            info!("User {} has no active schools, will be suspended", staff.email);
            suspend(&ctx.directory, &mut ctx.audit, staff, &settings.policy)
                .await
                .map(StaffOutcome::Suspend)
        }
    }
}

/// Log and audit a per staff error
fn record_failure<W: Write>(audit: &mut AuditLog<W>, email: Option<&str>, err: &ProcessingError) {
    let line = format!("Error on {}: {err}", email.unwrap_or("unreadable users row"));
    error!("{line}");
    if let Err(e) = audit.record(&line) {
        error!("Failed to write to the audit log: {e}");
    }
}

/// Go through all schools and their staff once.
///
/// Errors for a single staff member are logged and collected in the report. Only errors
/// reading the school or staff lists, or fatal directory errors, end the pass early.
pub async fn run_once<S: SourceStore, D: Directory, W: Write>(
    ctx: &mut RunContext<S, D, W>,
    settings: &SyncSettings,
    watcher: &tokio::sync::watch::Receiver<InShutdown>,
) -> Result<RunReport, SyncError> {
    let mut report = RunReport::default();
    let schools = ctx.source.schools().await?;
    info!("Got {} schools.", schools.len());

    for school in &schools {
        info!(
            "{} | {} | {}",
            school.name,
            school.number,
            school.staff_org_unit(&settings.staff_ou_root)
        );
        report.schools += 1;
        let staff = ctx.source.staff_for_school(school.number).await?;
        for member in staff {
            if matches!(*watcher.borrow(), InShutdown::Yes) {
                report.interrupted = true;
                return Ok(report);
            }
            let member = match member {
                Ok(x) => x,
                Err(e) => {
                    let dcid = e.dcid();
                    let err = ProcessingError::Source(e);
                    record_failure(&mut ctx.audit, None, &err);
                    report.results.push(StaffResult {
                        dcid,
                        email: None,
                        outcome: Err(err),
                    });
                    continue;
                }
            };
            let outcome = process_staff(ctx, school, &member, settings).await;
            match outcome {
                Err(e) if e.is_fatal() => {
                    record_failure(&mut ctx.audit, Some(member.email.as_str()), &e);
                    return Err(SyncError::Fatal(member.dcid, e));
                }
                Err(ref e) => record_failure(&mut ctx.audit, Some(member.email.as_str()), e),
                Ok(_) => {}
            }
            report.results.push(StaffResult {
                dcid: Some(member.dcid),
                email: Some(member.email),
                outcome,
            });
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchoolStaffRecord;
    use crate::google::GoogleApiError;
    use crate::testing::{FakeDirectory, FakeSource, staff_member};
    use std::collections::HashMap;

    fn settings() -> SyncSettings {
        SyncSettings {
            staff_ou_root: "/D118 Staff".to_string(),
            policy: SuspendPolicy {
                cross_reference: "Synchronization_Data.DCID".to_string(),
                apply: true,
                suspended_ou: None,
                frozen_ous: vec![],
            },
        }
    }

    fn active(school_id: i64, staff_status: i64) -> SchoolStaffRecord {
        SchoolStaffRecord {
            school_id,
            status: 1,
            staff_status: Some(staff_status),
            cell_phone: None,
        }
    }

    fn schools() -> Vec<School> {
        vec![
            School {
                name: "Westview Elementary".to_string(),
                number: 3,
            },
            School {
                name: "Wood Dale Junior High".to_string(),
                number: 5,
            },
        ]
    }

    fn context(
        source: FakeSource,
        directory: FakeDirectory,
    ) -> RunContext<FakeSource, FakeDirectory, Vec<u8>> {
        RunContext {
            source,
            directory,
            audit: AuditLog::new(Vec::new()),
        }
    }

    fn audit_text(ctx: RunContext<FakeSource, FakeDirectory, Vec<u8>>) -> String {
        String::from_utf8(ctx.audit.into_inner()).unwrap()
    }

    #[tokio::test]
    async fn enables_and_suspends_across_schools() {
        let source = FakeSource {
            schools: schools(),
            staff: HashMap::from([
                (3, vec![staff_member(30, 3, &["5"])]),
                (5, vec![staff_member(52, 5, &[]), staff_member(51, 5, &[])]),
            ]),
            records: HashMap::from([(30, vec![active(3, 1)]), (51, vec![active(3, 2)])]),
            ..Default::default()
        };
        let directory = FakeDirectory::with_accounts(vec![(52, "gone@d118.org", false)]);
        let (_tx, rx) = tokio::sync::watch::channel(InShutdown::No);
        let mut ctx = context(source, directory);

        let report = run_once(&mut ctx, &settings(), &rx).await.unwrap();
        assert_eq!(report.schools, 2);
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.enabled(), 2);
        assert_eq!(report.suspend_outcomes(SuspendOutcome::Suspended), 1);
        assert_eq!(report.errors().count(), 0);
        assert!(!report.interrupted);

        let first = &report.results[0];
        assert_eq!(first.dcid, Some(30));
        assert_eq!(
            first.outcome.as_ref().unwrap(),
            &StaffOutcome::Enabled {
                school_access: BTreeSet::from(["3".to_string(), "5".to_string()]),
                staff_type: Some(StaffType::Teacher),
                org_unit: "/D118 Staff/Westview Elementary Staff".to_string(),
            }
        );
        // active only away from home
        assert!(matches!(
            report.results[2].outcome,
            Ok(StaffOutcome::Enabled {
                staff_type: None,
                ..
            })
        ));
        assert_eq!(ctx.directory.updates().len(), 1);
        assert_eq!(ctx.directory.updates()[0].0, "gone@d118.org");
        assert!(audit_text(ctx).contains("Suspending gone@d118.org with DCID 52"));
    }

    #[tokio::test]
    async fn errors_on_one_staff_member_do_not_stop_the_pass() {
        let source = FakeSource {
            schools: schools(),
            staff: HashMap::from([(
                5,
                vec![
                    staff_member(53, 5, &[]),
                    staff_member(52, 5, &[]),
                    staff_member(51, 5, &[]),
                ],
            )]),
            records: HashMap::from([(53, vec![active(5, 1)]), (51, vec![active(5, 2)])]),
            failing: [52].into_iter().collect(),
            ..Default::default()
        };
        let (_tx, rx) = tokio::sync::watch::channel(InShutdown::No);
        let mut ctx = context(source, FakeDirectory::with_accounts(vec![]));

        let report = run_once(&mut ctx, &settings(), &rx).await.unwrap();
        assert_eq!(*ctx.source.looked_up.lock().unwrap(), vec![53, 52, 51]);
        assert_eq!(report.enabled(), 2);
        let failed = report.errors().collect::<Vec<_>>();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].dcid, Some(52));
        assert!(matches!(
            failed[0].outcome,
            Err(ProcessingError::Source(_))
        ));
        assert!(audit_text(ctx).contains("Error on 52@d118.org: DBError"));
    }

    #[tokio::test]
    async fn missing_directory_account_is_only_a_warning() {
        let source = FakeSource {
            schools: schools(),
            staff: HashMap::from([(3, vec![staff_member(31, 3, &[])])]),
            ..Default::default()
        };
        let (_tx, rx) = tokio::sync::watch::channel(InShutdown::No);
        let mut ctx = context(source, FakeDirectory::with_accounts(vec![]));

        let report = run_once(&mut ctx, &settings(), &rx).await.unwrap();
        assert_eq!(report.suspend_outcomes(SuspendOutcome::NotFound), 1);
        assert_eq!(report.errors().count(), 0);
        assert!(ctx.directory.updates().is_empty());
        let audit = audit_text(ctx);
        assert_eq!(audit.lines().count(), 1);
        assert!(audit.contains("Warning: Found inactive user DCID 31"));
    }

    #[tokio::test]
    async fn rejected_credentials_abort_the_pass() {
        let source = FakeSource {
            schools: schools(),
            staff: HashMap::from([(3, vec![staff_member(32, 3, &[]), staff_member(31, 3, &[])])]),
            ..Default::default()
        };
        let directory = FakeDirectory::with_accounts(vec![]);
        directory.fail_search_with(|| GoogleApiError::Unauthorized("revoked".to_string()));
        let (_tx, rx) = tokio::sync::watch::channel(InShutdown::No);
        let mut ctx = context(source, directory);

        let err = run_once(&mut ctx, &settings(), &rx).await.unwrap_err();
        assert!(matches!(err, SyncError::Fatal(32, _)));
        assert_eq!(*ctx.source.looked_up.lock().unwrap(), vec![32]);
    }

    #[tokio::test]
    async fn failing_staff_query_aborts_the_pass() {
        let source = FakeSource {
            schools: schools(),
            failing_schools: [3].into_iter().collect(),
            ..Default::default()
        };
        let (_tx, rx) = tokio::sync::watch::channel(InShutdown::No);
        let mut ctx = context(source, FakeDirectory::with_accounts(vec![]));
        let err = run_once(&mut ctx, &settings(), &rx).await.unwrap_err();
        assert!(matches!(err, SyncError::DB(_)));
    }

    #[tokio::test]
    async fn shutdown_cancels_a_pending_setup_step() {
        let (tx, rx) = tokio::sync::watch::channel(InShutdown::No);
        let sender = tokio::spawn(async move {
            tokio::task::yield_now().await;
            tx.send_replace(InShutdown::Yes);
            tx
        });
        let res = interruptible(std::future::pending::<Result<(), SyncError>>(), &rx).await;
        assert!(matches!(res, Err(SyncError::Interrupted)));
        drop(sender.await.unwrap());
    }

    #[tokio::test]
    async fn setup_steps_run_without_a_shutdown() {
        let (tx, rx) = tokio::sync::watch::channel(InShutdown::No);
        assert_eq!(interruptible(async { Ok(5) }, &rx).await.unwrap(), 5);
        let failing = async { Err::<(), _>(SyncError::Audit(std::io::ErrorKind::NotFound.into())) };
        let res = interruptible(failing, &rx).await;
        assert!(matches!(res, Err(SyncError::Audit(_))));

        tx.send_replace(InShutdown::Yes);
        let started = std::sync::atomic::AtomicBool::new(false);
        let res = interruptible(
            async {
                started.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            },
            &rx,
        )
        .await;
        assert!(matches!(res, Err(SyncError::Interrupted)));
        assert!(!started.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_stops_between_staff_members() {
        let source = FakeSource {
            schools: schools(),
            staff: HashMap::from([(3, vec![staff_member(32, 3, &[]), staff_member(31, 3, &[])])]),
            ..Default::default()
        };
        let (tx, rx) = tokio::sync::watch::channel(InShutdown::No);
        tx.send_replace(InShutdown::Yes);
        let mut ctx = context(source, FakeDirectory::with_accounts(vec![]));

        let report = run_once(&mut ctx, &settings(), &rx).await.unwrap();
        assert!(report.interrupted);
        assert!(report.results.is_empty());
        assert!(ctx.source.looked_up.lock().unwrap().is_empty());
    }
}
