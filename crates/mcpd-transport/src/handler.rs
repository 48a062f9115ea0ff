use std::sync::Arc;

use rmcp::model::{ClientInfo, LoggingMessageNotificationParam};
use rmcp::service::NotificationContext;
use rmcp::{ClientHandler, RoleClient};

use mcpd_core::{LogBus, LogLevel, SpecFingerprint};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChangedKind {
    Tools,
    Resources,
    Prompts,
}

/// A downstream server announced that one of its lists changed.
#[derive(Debug, Clone)]
pub struct ListChangedEvent {
    pub fingerprint: SpecFingerprint,
    pub kind: ListChangedKind,
}

/// Client-side handler for every downstream session.
///
/// Forwards list-changed notifications into the aggregation refresh queue
/// and downstream log notifications onto the log bus.
#[derive(Clone)]
pub struct HostClientHandler {
    server_name: String,
    fingerprint: SpecFingerprint,
    events: mpsc::UnboundedSender<ListChangedEvent>,
    logs: Arc<LogBus>,
    info: ClientInfo,
}

impl HostClientHandler {
    pub fn new(
        server_name: &str,
        fingerprint: SpecFingerprint,
        events: mpsc::UnboundedSender<ListChangedEvent>,
        logs: Arc<LogBus>,
    ) -> Self {
        let mut info = ClientInfo::default();
        info.client_info.name = "mcpd".to_string();
        info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        Self {
            server_name: server_name.to_string(),
            fingerprint,
            events,
            logs,
            info,
        }
    }

    fn emit(&self, kind: ListChangedKind) {
        let _ = self.events.send(ListChangedEvent {
            fingerprint: self.fingerprint.clone(),
            kind,
        });
    }

    fn log_source(&self) -> String {
        format!("server/{}", self.server_name)
    }
}

impl ClientHandler for HostClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.emit(ListChangedKind::Tools);
        std::future::ready(())
    }

    fn on_resource_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.emit(ListChangedKind::Resources);
        std::future::ready(())
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.emit(ListChangedKind::Prompts);
        std::future::ready(())
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let level = logging_level(&params);
        let message = params.data.to_string();
        self.logs.publish(&self.log_source(), level, message);
        std::future::ready(())
    }
}

fn logging_level(params: &LoggingMessageNotificationParam) -> LogLevel {
    use rmcp::model::LoggingLevel;
    match params.level {
        LoggingLevel::Debug => LogLevel::Debug,
        LoggingLevel::Info | LoggingLevel::Notice => LogLevel::Info,
        LoggingLevel::Warning => LogLevel::Warn,
        _ => LogLevel::Error,
    }
}
