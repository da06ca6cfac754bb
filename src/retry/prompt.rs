use crate::leases::LeaseRecord;
use async_trait::async_trait;
use std::io::{BufRead, Write};
use tracing::warn;

/// Decides whether a stale lease may be overridden.
///
/// Called once per stale detection. Returning `true` lets the orchestrator
/// force-acquire the lease; `false` aborts the run without touching it.
#[async_trait]
pub trait OverridePrompt: Send + Sync {
    async fn confirm_override(&self, resource: &str, stale: Option<&LeaseRecord>) -> bool;
}

/// Never overrides; stale leases abort the run
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclineOverride;

#[async_trait]
impl OverridePrompt for DeclineOverride {
    async fn confirm_override(&self, _resource: &str, _stale: Option<&LeaseRecord>) -> bool {
        false
    }
}

/// Always overrides stale leases
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptOverride;

#[async_trait]
impl OverridePrompt for AcceptOverride {
    async fn confirm_override(&self, _resource: &str, _stale: Option<&LeaseRecord>) -> bool {
        true
    }
}

/// Asks on the terminal, defaulting to no
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    fn question(resource: &str, stale: Option<&LeaseRecord>) -> String {
        match stale {
            Some(record) => format!(
                "Lock on '{}' appears stale ({}).\nOverride it? [y/N] ",
                resource, record
            ),
            None => format!("Lock on '{}' is unreadable.\nOverride it? [y/N] ", resource),
        }
    }
}

#[async_trait]
impl OverridePrompt for TerminalPrompt {
    async fn confirm_override(&self, resource: &str, stale: Option<&LeaseRecord>) -> bool {
        let question = Self::question(resource, stale);
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr();
            stderr.write_all(question.as_bytes())?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => is_yes(&line),
            Ok(Err(e)) => {
                warn!(error = %e, "could not read override answer");
                false
            }
            Err(e) => {
                warn!(error = %e, "override prompt task failed");
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }

    #[tokio::test]
    async fn test_fixed_prompts() {
        assert!(AcceptOverride.confirm_override("main.db", None).await);
        assert!(!DeclineOverride.confirm_override("main.db", None).await);
    }
}
