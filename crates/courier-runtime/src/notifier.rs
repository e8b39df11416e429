//! One-shot startup notifications to the configured owners.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use courier_core::MessagePayload;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{scheduler::Scheduler, transport::SessionHandle};

/// Reports how many commands the bot currently serves.
pub type CommandCountSource = Arc<dyn Fn() -> usize + Send + Sync>;

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Normalized transport addresses.
    pub recipients: Vec<String>,
    pub bot_name: String,
    pub version: String,
    pub prefix: String,
    pub public_mode: bool,
    pub online_delay: Duration,
    pub status_delay: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            bot_name: "Courier".to_owned(),
            version: "0.0.0".to_owned(),
            prefix: ".".to_owned(),
            public_mode: false,
            online_delay: Duration::from_secs(2),
            status_delay: Duration::from_secs(5),
        }
    }
}

/// Delivery outcome of one notification round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifySummary {
    pub delivered: usize,
    pub failed: usize,
}

struct Shared {
    config: NotifierConfig,
    command_count: CommandCountSource,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    current: Mutex<Option<SessionHandle>>,
}

impl Shared {
    fn current_session(&self) -> Option<SessionHandle> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Sends the online notice and status report after the first open.
///
/// The guard flips exactly once per process; later opens only refresh the
/// session used by notifications that are still pending.
pub struct StartupNotifier {
    shared: Arc<Shared>,
    scheduler: Scheduler,
    fired: AtomicBool,
}

impl StartupNotifier {
    pub fn new(config: NotifierConfig, scheduler: Scheduler, command_count: CommandCountSource) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                command_count,
                started_at: Instant::now(),
                started_wall: Utc::now(),
                current: Mutex::new(None),
            }),
            scheduler,
            fired: AtomicBool::new(false),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_wall
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Record the new session and schedule notifications on the first call.
    ///
    /// Returns `true` only for the call that scheduled them.
    pub fn on_open(&self, session: &SessionHandle) -> bool {
        *self
            .shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(session.clone());

        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("startup notifications already sent this process");
            return false;
        }
        if self.shared.config.recipients.is_empty() {
            info!("no owner recipients configured; skipping startup notifications");
            return true;
        }

        let shared = Arc::clone(&self.shared);
        self.scheduler
            .schedule("online_notice", self.shared.config.online_delay, async move {
                let text = render_online_notice(&shared.config, shared.started_wall);
                deliver(&shared, "online notice", text).await;
            });

        let shared = Arc::clone(&self.shared);
        self.scheduler
            .schedule("status_report", self.shared.config.status_delay, async move {
                let text = render_status_report(
                    &shared.config,
                    shared.started_wall,
                    shared.started_at.elapsed(),
                    (shared.command_count)(),
                );
                deliver(&shared, "status report", text).await;
            });

        true
    }

    /// The session that owned pending notifications is gone.
    pub fn on_close(&self) {
        self.shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn cancel_pending(&self) {
        self.scheduler.cancel();
    }

    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }
}

async fn deliver(shared: &Shared, label: &'static str, text: String) {
    let Some(session) = shared.current_session() else {
        warn!(notification = label, "connection not open; skipping notification");
        return;
    };
    let summary = notify_all(&session, &shared.config.recipients, MessagePayload::text(text)).await;
    info!(
        notification = label,
        delivered = summary.delivered,
        failed = summary.failed,
        "startup notification sent"
    );
}

/// Send `payload` to every recipient; one failure never blocks the rest.
pub async fn notify_all(
    session: &SessionHandle,
    recipients: &[String],
    payload: MessagePayload,
) -> NotifySummary {
    let mut summary = NotifySummary::default();
    for recipient in recipients {
        match session.send_message(recipient, payload.clone()).await {
            Ok(message_id) => {
                debug!(recipient = %recipient, message_id = %message_id, "notification delivered");
                summary.delivered += 1;
            }
            Err(err) => {
                error!(recipient = %recipient, error = %err, "failed to notify recipient");
                summary.failed += 1;
            }
        }
    }
    summary
}

fn render_online_notice(config: &NotifierConfig, started: DateTime<Utc>) -> String {
    format!(
        "{} is online\nStarted: {}\nPrefix: {}",
        config.bot_name,
        started.format("%Y-%m-%d %H:%M:%S UTC"),
        config.prefix
    )
}

fn render_status_report(
    config: &NotifierConfig,
    started: DateTime<Utc>,
    uptime: Duration,
    command_count: usize,
) -> String {
    let mode = if config.public_mode { "public" } else { "private" };
    format!(
        "{name} status\nVersion: {version}\nStarted: {started}\nUptime: {uptime}\nMode: {mode}\nPrefix: {prefix}\nCommands: {command_count}",
        name = config.bot_name,
        version = config.version,
        started = started.format("%Y-%m-%d %H:%M:%S UTC"),
        uptime = format_uptime(uptime),
        prefix = config.prefix,
    )
}

fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let (hours, minutes, seconds) = (total / 3_600, (total % 3_600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Recorder;
    use tokio_util::sync::CancellationToken;

    fn notifier(recipients: &[&str]) -> StartupNotifier {
        let config = NotifierConfig {
            recipients: recipients.iter().map(|r| (*r).to_owned()).collect(),
            bot_name: "Courier".to_owned(),
            version: "1.2.3".to_owned(),
            ..NotifierConfig::default()
        };
        StartupNotifier::new(
            config,
            Scheduler::new(&CancellationToken::new()),
            Arc::new(|| 12),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_process() {
        let recorder = Arc::new(Recorder::default());
        let session = recorder.session();
        let notifier = notifier(&["owner@s.whatsapp.net"]);

        assert!(notifier.on_open(&session));
        assert!(!notifier.on_open(&session));
        notifier.wait_idle().await;

        let sent = recorder.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.conversation.contains("Courier is online"));
        assert!(sent[1].1.conversation.contains("Version: 1.2.3"));
        assert!(sent[1].1.conversation.contains("Commands: 12"));
        assert!(sent[1].1.conversation.contains("Mode: private"));
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_recipient_does_not_block_others() {
        let recorder = Arc::new(Recorder::failing_for("bad@s.whatsapp.net"));
        let notifier = notifier(&["bad@s.whatsapp.net", "good@s.whatsapp.net"]);

        notifier.on_open(&recorder.session());
        notifier.wait_idle().await;

        let targets: Vec<String> = recorder.sent().into_iter().map(|(to, _)| to).collect();
        assert_eq!(targets, vec!["good@s.whatsapp.net", "good@s.whatsapp.net"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_stops_scheduled_notices() {
        let recorder = Arc::new(Recorder::default());
        let notifier = notifier(&["owner@s.whatsapp.net"]);

        notifier.on_open(&recorder.session());
        tokio::time::sleep(Duration::from_secs(3)).await;
        notifier.cancel_pending();
        notifier.wait_idle().await;

        assert_eq!(recorder.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn notices_skip_while_disconnected() {
        let recorder = Arc::new(Recorder::default());
        let notifier = notifier(&["owner@s.whatsapp.net"]);

        notifier.on_open(&recorder.session());
        notifier.on_close();
        notifier.wait_idle().await;

        assert!(recorder.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_notices_use_the_latest_session() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let notifier = notifier(&["owner@s.whatsapp.net"]);

        assert!(notifier.on_open(&first.session()));
        notifier.on_close();
        assert!(!notifier.on_open(&second.session()));
        notifier.wait_idle().await;

        assert!(first.sent().is_empty());
        assert_eq!(second.sent().len(), 2);
    }

    #[tokio::test]
    async fn empty_recipient_list_still_trips_the_guard() {
        let notifier = notifier(&[]);
        let recorder = Arc::new(Recorder::default());
        assert!(notifier.on_open(&recorder.session()));
        assert!(notifier.has_fired());
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(42)), "42s");
        assert_eq!(format_uptime(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "1h 2m 5s");
    }
}
