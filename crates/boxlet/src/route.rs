//! Route table and blueprints.
//!
//! A route binds one `cmd` to one handler. Blueprints bundle routes (and
//! request hooks scoped to them) under a name so they can be merged into an
//! [`Application`](crate::Application). A cmd is unique across the whole
//! merged table: a second registration is a startup error, never an
//! overwrite, so merge order does not matter.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Cmd;
use crate::request::{HandlerError, Reply, Request};

/// Request handler bound to a cmd.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one request. The returned reply is written unless the
    /// handler already called [`Request::write`].
    async fn handle(&self, req: &mut Request) -> anyhow::Result<Reply>;
}

/// Adapter turning a synchronous closure into a [`Handler`].
pub struct FnHandler<F, R> {
    f: F,
    _reply: PhantomData<fn() -> R>,
}

pub fn handler_fn<F, R>(f: F) -> FnHandler<F, R>
where
    F: Fn(&mut Request) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Into<Reply> + 'static,
{
    FnHandler {
        f,
        _reply: PhantomData,
    }
}

#[async_trait]
impl<F, R> Handler for FnHandler<F, R>
where
    F: Fn(&mut Request) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Into<Reply> + 'static,
{
    async fn handle(&self, req: &mut Request) -> anyhow::Result<Reply> {
        (self.f)(req).map(Into::into)
    }
}

/// Runs before the handler; may call [`Request::interrupt`] to skip it.
pub type BeforeRequestHook = Arc<dyn Fn(&mut Request) -> anyhow::Result<()> + Send + Sync>;

/// Runs after the handler (or the interrupt), with the handler error if any.
pub type AfterRequestHook = Arc<dyn Fn(&Request, Option<&HandlerError>) + Send + Sync>;

/// Who registered a route. Used in conflict reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOwner {
    Application,
    Blueprint(String),
}

impl fmt::Display for RouteOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => f.write_str("the application"),
            Self::Blueprint(name) => write!(f, "blueprint '{}'", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate route for cmd {cmd}: registered by {first}, registered again by {second}")]
pub struct DuplicateRouteError {
    pub cmd: Cmd,
    pub first: RouteOwner,
    pub second: RouteOwner,
}

#[derive(Clone)]
pub struct Route {
    cmd: Cmd,
    handler: Arc<dyn Handler>,
    blueprint: Option<Arc<str>>,
}

impl Route {
    pub fn cmd(&self) -> Cmd {
        self.cmd
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Name of the owning blueprint, `None` for application routes.
    pub fn blueprint(&self) -> Option<&str> {
        self.blueprint.as_deref()
    }

    fn owner(&self) -> RouteOwner {
        match &self.blueprint {
            Some(name) => RouteOwner::Blueprint(name.to_string()),
            None => RouteOwner::Application,
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("cmd", &self.cmd)
            .field("blueprint", &self.blueprint)
            .finish_non_exhaustive()
    }
}

/// Merged cmd → route map. Read-only once the application is built.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<Cmd, Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        cmd: Cmd,
        handler: Arc<dyn Handler>,
        blueprint: Option<Arc<str>>,
    ) -> Result<(), DuplicateRouteError> {
        let route = Route {
            cmd,
            handler,
            blueprint,
        };
        if let Some(existing) = self.routes.get(&cmd) {
            return Err(DuplicateRouteError {
                cmd,
                first: existing.owner(),
                second: route.owner(),
            });
        }
        self.routes.insert(cmd, route);
        Ok(())
    }

    pub fn resolve(&self, cmd: Cmd) -> Option<&Route> {
        self.routes.get(&cmd)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered cmds in ascending order.
    pub fn cmds(&self) -> Vec<Cmd> {
        let mut cmds: Vec<Cmd> = self.routes.keys().copied().collect();
        cmds.sort_unstable();
        cmds
    }
}

/// Named, composable bundle of routes.
pub struct Blueprint {
    name: String,
    pub(crate) routes: Vec<(Cmd, Arc<dyn Handler>)>,
    pub(crate) before_request: Vec<BeforeRequestHook>,
    pub(crate) after_request: Vec<AfterRequestHook>,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
            before_request: Vec::new(),
            after_request: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a route. Duplicates are reported when the application is built.
    pub fn register(mut self, cmd: Cmd, handler: impl Handler) -> Self {
        self.routes.push((cmd, Arc::new(handler)));
        self
    }

    /// Hook run only for requests resolved to this blueprint's routes,
    /// after the application-wide hooks.
    pub fn before_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.before_request.push(Arc::new(hook));
        self
    }

    pub fn after_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request, Option<&HandlerError>) + Send + Sync + 'static,
    {
        self.after_request.push(Arc::new(hook));
        self
    }

    pub fn cmds(&self) -> impl Iterator<Item = Cmd> + '_ {
        self.routes.iter().map(|(cmd, _)| *cmd)
    }
}

impl fmt::Debug for Blueprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blueprint")
            .field("name", &self.name)
            .field("cmds", &self.cmds().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
