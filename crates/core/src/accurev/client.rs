//! Asynchronous AccuRev CLI client.
//!
//! Every query is retried on transient failure with a bounded budget before
//! the error is surfaced; an exhausted budget never yields a silent empty
//! result. The XML-returning variants hand back `TaskId`-normalized output
//! so identical queries store byte-identical snapshots.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::parser::{
    normalize_task_id, parse_depots, parse_diff, parse_hist, parse_info, parse_streams,
    SessionInfo,
};
use crate::errors::AccuRevError;
use crate::models::{Depot, DiffReport, StreamSnapshot, Transaction};

/// Asynchronous client for interacting with an AccuRev server via the CLI.
#[derive(Debug, Clone)]
pub struct AccuRevClient {
    username: String,
    password: Option<String>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl AccuRevClient {
    /// Create a new client for the given principal. The password may be
    /// absent; it is only needed when a fresh login is required.
    pub fn new(
        username: impl Into<String>,
        password: Option<String>,
        retry_attempts: u32,
        retry_delay_secs: u64,
    ) -> Self {
        let client = Self {
            username: username.into(),
            password,
            retry_attempts: retry_attempts.max(1),
            retry_delay: Duration::from_secs(retry_delay_secs),
        };
        info!(username = %client.username, "created AccuRevClient");
        client
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    #[instrument(skip(self))]
    pub async fn session_info(&self) -> Result<SessionInfo, AccuRevError> {
        let output = self.run_with_retry(&["info"]).await?;
        parse_info(&output)
    }

    /// Make sure the session belongs to the configured principal, logging
    /// out another user's session and logging in if needed.
    #[instrument(skip(self))]
    pub async fn ensure_session(&self) -> Result<(), AccuRevError> {
        let session = self.session_info().await?;
        if session.principal == self.username {
            debug!(principal = %session.principal, "session already established");
            return Ok(());
        }
        if session.is_logged_in() {
            info!(principal = %session.principal, "logging out foreign session");
            self.run_with_retry(&["logout"]).await?;
        }
        let password = self.password.as_deref().ok_or_else(|| {
            AccuRevError::LoginFailed {
                username: self.username.clone(),
                detail: "no password resolved from the environment".into(),
            }
        })?;
        info!(username = %self.username, "logging in");
        self.run_with_retry(&["login", &self.username, password])
            .await?;

        let session = self.session_info().await?;
        if session.principal != self.username {
            return Err(AccuRevError::LoginFailed {
                username: self.username.clone(),
                detail: format!("session principal is '{}' after login", session.principal),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn depots_xml(&self) -> Result<String, AccuRevError> {
        let output = self.run_with_retry(&["show", "-fx", "depots"]).await?;
        Ok(normalize_task_id(&output))
    }

    pub async fn depots(&self) -> Result<Vec<Depot>, AccuRevError> {
        let xml = self.depots_xml().await?;
        parse_depots(&xml)
    }

    /// `show streams` listing, optionally narrowed to one stream and to a
    /// point in time. Includes deactivated streams so set-difference
    /// comparisons across transactions stay stable.
    #[instrument(skip(self), fields(depot))]
    pub async fn streams_xml(
        &self,
        depot: &str,
        stream: Option<&str>,
        time_spec: Option<&str>,
    ) -> Result<String, AccuRevError> {
        let mut args = vec!["show", "-fxig"];
        if let Some(stream) = stream {
            args.push("-s");
            args.push(stream);
        }
        if let Some(spec) = time_spec {
            args.push("-t");
            args.push(spec);
        }
        args.push("-p");
        args.push(depot);
        args.push("streams");
        let output = self.run_with_retry(&args).await?;
        Ok(normalize_task_id(&output))
    }

    pub async fn streams(
        &self,
        depot: &str,
        stream: Option<&str>,
        time_spec: Option<&str>,
    ) -> Result<StreamSnapshot, AccuRevError> {
        let xml = self.streams_xml(depot, stream, time_spec).await?;
        parse_streams(&xml)
    }

    /// Expanded-format history for a depot or a single stream, optionally
    /// narrowed to one transaction kind. A single time spec yields the
    /// latest matching transaction at or before it; a `A-B` range yields
    /// every matching transaction in between. The returned transactions
    /// are sorted ascending by id regardless of server order.
    #[instrument(skip(self), fields(depot, time_spec))]
    pub async fn hist_xml(
        &self,
        depot: &str,
        stream: Option<&str>,
        time_spec: &str,
        kind: Option<&str>,
    ) -> Result<String, AccuRevError> {
        let mut args = vec!["hist", "-p", depot];
        if let Some(stream) = stream {
            args.push("-s");
            args.push(stream);
        }
        args.push("-t");
        args.push(time_spec);
        if let Some(kind) = kind {
            args.push("-k");
            args.push(kind);
        }
        args.push("-fex");
        let output = self.run_with_retry(&args).await?;
        Ok(normalize_task_id(&output))
    }

    pub async fn hist(
        &self,
        depot: &str,
        stream: Option<&str>,
        time_spec: &str,
        kind: Option<&str>,
    ) -> Result<Vec<Transaction>, AccuRevError> {
        let xml = self.hist_xml(depot, stream, time_spec, kind).await?;
        let mut transactions = parse_hist(&xml)?;
        transactions.sort_by_key(|tr| tr.id);
        Ok(transactions)
    }

    /// The server's most recent transaction for the depot.
    pub async fn latest_transaction(
        &self,
        depot: &str,
    ) -> Result<Option<Transaction>, AccuRevError> {
        let transactions = self.hist(depot, None, "now", None).await?;
        Ok(transactions.into_iter().max_by_key(|tr| tr.id))
    }

    /// Diff a stream against itself across a transaction range, listing all
    /// elements (`-a`) including inherited changes (`-i`).
    #[instrument(skip(self), fields(stream, tx1, tx2))]
    pub async fn diff_xml(
        &self,
        stream: &str,
        tx1: u64,
        tx2: u64,
    ) -> Result<String, AccuRevError> {
        let range = format!("{}-{}", tx1, tx2);
        let args = [
            "diff", "-a", "-i", "-v", stream, "-V", stream, "-t", &range, "-fx",
        ];
        let output = self.run_with_retry(&args).await?;
        Ok(normalize_task_id(&output))
    }

    pub async fn diff(
        &self,
        stream: &str,
        tx1: u64,
        tx2: u64,
    ) -> Result<DiffReport, AccuRevError> {
        let xml = self.diff_xml(stream, tx1, tx2).await?;
        parse_diff(&xml)
    }

    /// Materialize a stream's content at a transaction into `dest`. Writes
    /// only to the local working tree.
    #[instrument(skip(self), fields(stream, transaction, dest = %dest.display()))]
    pub async fn pop(
        &self,
        stream: &str,
        transaction: u64,
        dest: &Path,
        overwrite: bool,
    ) -> Result<(), AccuRevError> {
        let tx = transaction.to_string();
        let dest_str = dest.to_string_lossy().to_string();
        let mut args = vec!["pop", "-R"];
        if overwrite {
            args.push("-O");
        }
        args.push("-v");
        args.push(stream);
        args.push("-L");
        args.push(&dest_str);
        args.push("-t");
        args.push(&tx);
        args.push(".");
        self.run_with_retry(&args).await?;
        debug!(stream, transaction, "populated working tree");
        Ok(())
    }

    async fn run_with_retry(&self, args: &[&str]) -> Result<String, AccuRevError> {
        let mut last_err = None;
        for attempt in 1..=self.retry_attempts {
            match self.run_accurev(args).await {
                Ok(output) => return Ok(output),
                Err(err @ AccuRevError::BinaryNotFound(_)) => return Err(err),
                Err(err) => {
                    warn!(
                        attempt,
                        max_attempts = self.retry_attempts,
                        error = %err,
                        "accurev command failed"
                    );
                    last_err = Some(err);
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(AccuRevError::RetriesExhausted {
            command: format!("accurev {}", redacted(args).join(" ")),
            attempts: self.retry_attempts,
            detail: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn run_accurev(&self, args: &[&str]) -> Result<String, AccuRevError> {
        let mut cmd = Command::new("accurev");
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(cmd = ?format!("accurev {}", redacted(args).join(" ")), "running accurev command");
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AccuRevError::BinaryNotFound("accurev".into())
            } else {
                AccuRevError::IoError(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(AccuRevError::CommandFailed { exit_code, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Command words safe for logs; the login password is the argument after
/// the username.
fn redacted<'a>(args: &[&'a str]) -> Vec<&'a str> {
    if args.first() == Some(&"login") {
        args.iter()
            .take(2)
            .copied()
            .chain(std::iter::once("****"))
            .collect()
    } else {
        args.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_construction() {
        let client = AccuRevClient::new("converter", Some("pw".into()), 3, 3);
        assert_eq!(client.username(), "converter");
        assert_eq!(client.retry_attempts, 3);
    }

    #[test]
    fn test_retry_budget_floor() {
        let client = AccuRevClient::new("converter", None, 0, 0);
        assert_eq!(client.retry_attempts, 1);
    }

    #[test]
    fn test_login_redaction() {
        let args = ["login", "converter", "hunter2"];
        let shown = redacted(&args);
        assert_eq!(shown, vec!["login", "converter", "****"]);

        let args = ["show", "-fx", "depots"];
        assert_eq!(redacted(&args), vec!["show", "-fx", "depots"]);
    }
}
