//! Operator confirmation for level triggers.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Operator answer to a trigger prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
    TimedOut,
}

/// Asks the operator whether to act on a trigger.
#[async_trait]
pub trait ConfirmationSource: Send + Sync {
    async fn await_confirmation(&self, prompt: &str, timeout: Duration) -> Confirmation;
}

/// Answers fed through an mpsc channel, e.g. from a chat bot or another task.
///
/// Prompts are answered one at a time. Answers left over from an earlier
/// prompt are discarded before waiting.
pub struct ChannelConfirmation {
    answers: Mutex<mpsc::Receiver<bool>>,
}

impl ChannelConfirmation {
    pub fn new() -> (Self, mpsc::Sender<bool>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                answers: Mutex::new(rx),
            },
            tx,
        )
    }
}

#[async_trait]
impl ConfirmationSource for ChannelConfirmation {
    async fn await_confirmation(&self, prompt: &str, timeout: Duration) -> Confirmation {
        let mut answers = self.answers.lock().await;
        while answers.try_recv().is_ok() {
            debug!("Discarding stale confirmation");
        }

        debug!(prompt, "Waiting for confirmation");
        match tokio::time::timeout(timeout, answers.recv()).await {
            Ok(Some(true)) => Confirmation::Confirmed,
            Ok(Some(false)) | Ok(None) => Confirmation::Declined,
            Err(_) => Confirmation::TimedOut,
        }
    }
}

/// Yes/no prompt on the terminal.
pub struct StdinConfirmation {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinConfirmation {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl Default for StdinConfirmation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfirmationSource for StdinConfirmation {
    async fn await_confirmation(&self, prompt: &str, timeout: Duration) -> Confirmation {
        let mut lines = self.lines.lock().await;
        println!("{} [y/N] ({}s)", prompt, timeout.as_secs());

        match tokio::time::timeout(timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => parse_answer(&line),
            Ok(Ok(None)) | Ok(Err(_)) => Confirmation::Declined,
            Err(_) => Confirmation::TimedOut,
        }
    }
}

/// Always gives the same answer. Used for unattended runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedConfirmation(pub Confirmation);

#[async_trait]
impl ConfirmationSource for FixedConfirmation {
    async fn await_confirmation(&self, _prompt: &str, _timeout: Duration) -> Confirmation {
        self.0
    }
}

/// "y"/"yes" (any case) confirms; anything else declines.
pub fn parse_answer(line: &str) -> Confirmation {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Confirmation::Confirmed,
        _ => Confirmation::Declined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("Y\n"), Confirmation::Confirmed);
        assert_eq!(parse_answer(" yes "), Confirmation::Confirmed);
        assert_eq!(parse_answer("no"), Confirmation::Declined);
        assert_eq!(parse_answer(""), Confirmation::Declined);
    }

    #[tokio::test]
    async fn test_channel_answers() {
        let (source, tx) = ChannelConfirmation::new();

        let waiting = tokio::spawn(async move {
            let first = source
                .await_confirmation("act?", Duration::from_secs(5))
                .await;
            (source, first)
        });
        tokio::task::yield_now().await;
        tx.send(true).await.unwrap();
        let (source, first) = waiting.await.unwrap();
        assert_eq!(first, Confirmation::Confirmed);

        let waiting = tokio::spawn(async move {
            source
                .await_confirmation("act?", Duration::from_secs(5))
                .await
        });
        tokio::task::yield_now().await;
        tx.send(false).await.unwrap();
        assert_eq!(waiting.await.unwrap(), Confirmation::Declined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_times_out() {
        let (source, _tx) = ChannelConfirmation::new();
        let answer = source
            .await_confirmation("act?", Duration::from_secs(15))
            .await;
        assert_eq!(answer, Confirmation::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_answer_is_discarded() {
        let (source, tx) = ChannelConfirmation::new();
        tx.send(true).await.unwrap();
        let answer = source
            .await_confirmation("act?", Duration::from_secs(15))
            .await;
        assert_eq!(answer, Confirmation::TimedOut);
    }

    #[tokio::test]
    async fn test_closed_channel_declines() {
        let (source, tx) = ChannelConfirmation::new();
        drop(tx);
        let answer = source
            .await_confirmation("act?", Duration::from_secs(15))
            .await;
        assert_eq!(answer, Confirmation::Declined);
    }
}
