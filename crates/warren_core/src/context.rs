//! Ambient invocation context.
//!
//! Every dispatched handler — HTTP request, WS message, RPC, scheduled or
//! queued callback, email — runs inside a task-local scope carrying the
//! agent handle and whatever triggered the invocation. Registered methods
//! and library code reach it through [`current`] without threading
//! parameters everywhere.

use crate::agent::connection::Connection;
use crate::agent::handler::EmailMessage;
use crate::agent::instance::Agent;

/// Metadata about the request that triggered the current invocation.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
}

/// What the currently-running handler was invoked with.
#[derive(Clone)]
pub struct InvocationContext {
    pub agent: Agent,
    pub connection: Option<Connection>,
    pub request: Option<RequestInfo>,
    pub email: Option<EmailMessage>,
}

impl InvocationContext {
    /// A context with only the agent set (schedule/queue fires).
    pub fn bare(agent: Agent) -> Self {
        Self {
            agent,
            connection: None,
            request: None,
            email: None,
        }
    }

    pub fn with_connection(mut self, conn: Connection) -> Self {
        self.connection = Some(conn);
        self
    }

    pub fn with_request(mut self, info: RequestInfo) -> Self {
        self.request = Some(info);
        self
    }

    pub fn with_email(mut self, email: EmailMessage) -> Self {
        self.email = Some(email);
        self
    }
}

tokio::task_local! {
    static CONTEXT: InvocationContext;
}

/// Run `fut` inside the given invocation context.
pub(crate) async fn with_context<F>(ctx: InvocationContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CONTEXT.scope(ctx, fut).await
}

/// The current invocation context, if running inside a dispatched handler.
pub fn current() -> Option<InvocationContext> {
    CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// The agent the current handler is running for.
pub fn current_agent() -> Option<Agent> {
    current().map(|ctx| ctx.agent)
}

/// The connection the current handler was invoked from, if any.
pub fn current_connection() -> Option<Connection> {
    current().and_then(|ctx| ctx.connection)
}
