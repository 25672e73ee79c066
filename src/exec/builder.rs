use crate::config::types::{ConnectionId, SecurityContext};
use crate::exec::request::CommandRequest;

/// Fluent construction of a `CommandRequest`
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    request: CommandRequest,
}

impl CommandBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            request: CommandRequest {
                command: command.into(),
                ..CommandRequest::default()
            },
        }
    }

    pub fn connection(mut self, conn: ConnectionId) -> Self {
        self.request.connection_id = conn;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.request.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.request.working_dir = dir.into();
        self
    }

    pub fn input(mut self, data: impl Into<String>) -> Self {
        self.request.input_data = Some(data.into());
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.request.timeout_seconds = seconds;
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.request.capture_output = capture;
        self
    }

    pub fn async_exec(mut self, enabled: bool) -> Self {
        self.request.async_exec = enabled;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.request.priority = priority;
        self
    }

    pub fn security(mut self, ctx: SecurityContext) -> Self {
        self.request.security = Some(ctx);
        self
    }

    pub fn on_success(mut self, callback: impl Into<String>) -> Self {
        self.request.success_callback = Some(callback.into());
        self
    }

    pub fn on_error(mut self, callback: impl Into<String>) -> Self {
        self.request.error_callback = Some(callback.into());
        self
    }

    pub fn on_progress(mut self, callback: impl Into<String>) -> Self {
        self.request.progress_callback = Some(callback.into());
        self
    }

    pub fn requester(mut self, owner: impl Into<String>) -> Self {
        self.request.requester = Some(owner.into());
        self
    }

    pub fn build(self) -> CommandRequest {
        self.request
    }
}
