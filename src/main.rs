use std::collections::BTreeSet;
use std::str::FromStr;

use db::DBError;
use google::GoogleApiError;
use oauth::OAuthError;
use reconcile::ProcessingError;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, prelude::*};
use tracing_subscriber::{filter, fmt::format::FmtSpan};

mod audit;
mod config;
mod db;
mod google;
mod oauth;
mod reconcile;
mod sync;
#[cfg(test)]
mod testing;

/// A school as listed in the SIS. Reference data, never changed during a run.
#[derive(Debug, Clone, PartialEq)]
struct School {
    /// Title-cased display name, e.g. "Wood Dale Junior High"
    name: String,
    /// The school number; this is what `homeschoolid` and `schoolstaff.schoolid` refer to.
    number: i64,
}
impl School {
    /// The OU holding staff whose home school is this one: `<root>/<Name> Staff`
    fn staff_org_unit(&self, root: &str) -> String {
        format!("{}/{} Staff", root.trim_end_matches('/'), self.name)
    }
}

/// A single staff member as read from the `users` table.
#[derive(Debug, Clone, PartialEq)]
struct StaffMember {
    /// The users DCID. This is the value stored in the cross-reference attribute of the
    /// matching directory account.
    dcid: i64,
    email: String,
    first_name: String,
    last_name: String,
    teacher_number: Option<String>,
    security_group: Option<i64>,
    /// School codes this user may switch into, parsed from the semicolon separated
    /// `canchangeschool` column.
    explicit_access: BTreeSet<String>,
    /// The school number of the home school
    home_school: i64,
}

/// One `schoolstaff` row of a staff member. Only active rows are ever read.
#[derive(Debug, Clone, PartialEq)]
struct SchoolStaffRecord {
    school_id: i64,
    status: i64,
    /// Raw staff type code, see [`StaffType`]. NULL in some legacy rows.
    staff_status: Option<i64>,
    cell_phone: Option<String>,
}

/// Classification of a staff member at a given school.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StaffType {
    Unassigned,
    Teacher,
    Staff,
    Lunch,
    Substitute,
    /// A code this sync does not know about. Kept as is.
    Unknown(i64),
}
impl StaffType {
    fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Unassigned,
            1 => Self::Teacher,
            2 => Self::Staff,
            3 => Self::Lunch,
            4 => Self::Substitute,
            x => Self::Unknown(x),
        }
    }
}
impl core::fmt::Display for StaffType {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Unassigned => write!(f, "unassigned"),
            Self::Teacher => write!(f, "teacher"),
            Self::Staff => write!(f, "staff"),
            Self::Lunch => write!(f, "lunch staff"),
            Self::Substitute => write!(f, "substitute"),
            Self::Unknown(code) => write!(f, "unknown staff type {code}"),
        }
    }
}

enum InShutdown {
    Yes,
    No,
}

/// Something went wrong that stops the whole sync run
#[derive(Debug)]
pub enum SyncError {
    DB(DBError),
    Google(GoogleApiError),
    OAuth(OAuthError),
    /// The audit log could not be created
    Audit(std::io::Error),
    /// A shutdown signal came in before the pass started
    Interrupted,
    /// A single staff member hit an error that makes continuing pointless (e.g. revoked
    /// credentials).
    Fatal(i64, ProcessingError),
}
impl core::fmt::Display for SyncError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::DB(x) => write!(f, "DBError: {x}"),
            Self::Google(x) => write!(f, "GoogleApiError: {x}"),
            Self::OAuth(x) => write!(f, "OAuthError: {x}"),
            Self::Audit(x) => write!(f, "Cannot create the audit log: {x}"),
            Self::Interrupted => write!(f, "Interrupted before the sync started."),
            Self::Fatal(dcid, x) => write!(f, "Aborted while processing DCID {dcid}: {x}"),
        }
    }
}
impl core::error::Error for SyncError {}
impl From<DBError> for SyncError {
    fn from(value: DBError) -> Self {
        Self::DB(value)
    }
}
impl From<GoogleApiError> for SyncError {
    fn from(value: GoogleApiError) -> Self {
        Self::Google(value)
    }
}
impl From<OAuthError> for SyncError {
    fn from(value: OAuthError) -> Self {
        Self::OAuth(value)
    }
}

async fn signal_handler(
    mut watcher: tokio::sync::watch::Receiver<InShutdown>,
    shutdown_tx: tokio::sync::watch::Sender<InShutdown>,
) -> Result<(), std::io::Error> {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(x) => x,
        Err(e) => {
            error!("Failed to install SIGTERM listener: {e} Aborting.");
            shutdown_tx.send_replace(InShutdown::Yes);
            return Err(e);
        }
    };
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(x) => x,
        Err(e) => {
            error!("Failed to install SIGHUP listener: {e} Aborting.");
            shutdown_tx.send_replace(InShutdown::Yes);
            return Err(e);
        }
    };
    // wait for a shutdown signal, or for the sync to finish
    tokio::select! {
        _ = watcher.changed() => {}
        _ = sigterm.recv() => {
            info!("Got SIGTERM. Stopping the sync.");
            shutdown_tx.send_replace(InShutdown::Yes);
        }
        _ = sighup.recv() => {
            info!("Got SIGHUP. Stopping the sync.");
            shutdown_tx.send_replace(InShutdown::Yes);
        }
        x = tokio::signal::ctrl_c() =>  {
            match x {
                Ok(()) => {
                    info!("Received Ctrl-c. Stopping the sync.");
                    shutdown_tx.send_replace(InShutdown::Yes);
                }
                Err(err) => {
                    error!("Unable to listen for shutdown signal: {}", err);
                    shutdown_tx.send_replace(InShutdown::Yes);
                }
            }
        }
    };

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::Config::create()?;

    // Setup tracing
    let my_crate_filter = EnvFilter::new("staff_sync");
    let level_filter = filter::LevelFilter::from_str(&config.global.log_level)?;
    let subscriber = tracing_subscriber::registry().with(my_crate_filter).with(
        tracing_subscriber::fmt::layer()
            .compact()
            .with_span_events(FmtSpan::CLOSE)
            .with_line_number(true)
            .with_filter(level_filter),
    );
    tracing::subscriber::set_global_default(subscriber).expect("static tracing config");
    info!("Starting SIS -> Directory staff sync. Got config and set up tracing.");
    info!("Source: {:?}", config.source);

    // cancellation channel
    let (tx, rx) = tokio::sync::watch::channel(InShutdown::No);
    let signal_handle = tokio::spawn(signal_handler(tx.subscribe(), tx.clone()));

    // consent and connecting may block for a long time, a signal has to end them too
    let mut ctx = sync::interruptible(sync::RunContext::open(&config), &rx).await?;
    let report = sync::run_once(&mut ctx, &config.sync_settings(), &rx).await;
    // release the db pool and flush the audit log before reporting, on success and on error
    ctx.close().await;

    // the signal handler returns as soon as the channel changes
    tx.send_replace(InShutdown::Yes);
    signal_handle.await??;

    let report = report?;
    report.log_summary();
    Ok(())
}
