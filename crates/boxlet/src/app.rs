//! Application: the merged route table plus hooks, built once and shared
//! read-only by every process role.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::GroupId;
use crate::envelope::{Cmd, Envelope};
use crate::request::{HandlerError, Request};
use crate::route::{
    AfterRequestHook, BeforeRequestHook, Blueprint, DuplicateRouteError, Handler, Route,
    RouteTable,
};
use crate::worker::WorkerContext;

/// Picks the worker group for an incoming envelope.
pub type GroupRouter = Arc<dyn Fn(&Envelope) -> GroupId + Send + Sync>;

/// Runs in a worker process when it starts or stops serving.
pub type WorkerHook = Arc<dyn Fn(&WorkerContext) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    DuplicateRoute(#[from] DuplicateRouteError),
    #[error("blueprint '{0}' registered twice")]
    DuplicateBlueprint(String),
}

#[derive(Default)]
struct BlueprintHooks {
    before_request: Vec<BeforeRequestHook>,
    after_request: Vec<AfterRequestHook>,
}

pub struct ApplicationBuilder {
    name: String,
    routes: Vec<(Cmd, Arc<dyn Handler>)>,
    blueprints: Vec<Blueprint>,
    before_request: Vec<BeforeRequestHook>,
    after_request: Vec<AfterRequestHook>,
    worker_start: Vec<WorkerHook>,
    worker_stop: Vec<WorkerHook>,
    group_router: Option<GroupRouter>,
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self {
            name: "boxlet".to_string(),
            routes: Vec::new(),
            blueprints: Vec::new(),
            before_request: Vec::new(),
            after_request: Vec::new(),
            worker_start: Vec::new(),
            worker_stop: Vec::new(),
            group_router: None,
        }
    }
}

impl ApplicationBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an application-level route. Conflicts are reported by [`build`](Self::build).
    pub fn register(mut self, cmd: Cmd, handler: impl Handler) -> Self {
        self.routes.push((cmd, Arc::new(handler)));
        self
    }

    pub fn register_blueprint(mut self, blueprint: Blueprint) -> Self {
        self.blueprints.push(blueprint);
        self
    }

    /// Hook run for every request, before blueprint hooks.
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

    pub fn on_worker_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerContext) + Send + Sync + 'static,
    {
        self.worker_start.push(Arc::new(hook));
        self
    }

    pub fn on_worker_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerContext) + Send + Sync + 'static,
    {
        self.worker_stop.push(Arc::new(hook));
        self
    }

    /// Without a router every envelope goes to the first configured group.
    pub fn group_router<F>(mut self, router: F) -> Self
    where
        F: Fn(&Envelope) -> GroupId + Send + Sync + 'static,
    {
        self.group_router = Some(Arc::new(router));
        self
    }

    /// Merge application routes and blueprints into one table.
    ///
    /// This is the startup validation: any cmd registered twice, wherever
    /// the two registrations come from, fails the build.
    pub fn build(self) -> Result<Application, BuildError> {
        let mut table = RouteTable::new();
        for (cmd, handler) in self.routes {
            table.insert(cmd, handler, None)?;
        }

        let mut blueprint_hooks: HashMap<Arc<str>, BlueprintHooks> = HashMap::new();
        for bp in self.blueprints {
            let name: Arc<str> = Arc::from(bp.name());
            if blueprint_hooks.contains_key(&name) {
                return Err(BuildError::DuplicateBlueprint(name.to_string()));
            }
            for (cmd, handler) in bp.routes {
                table.insert(cmd, handler, Some(Arc::clone(&name)))?;
            }
            blueprint_hooks.insert(
                name,
                BlueprintHooks {
                    before_request: bp.before_request,
                    after_request: bp.after_request,
                },
            );
        }

        tracing::debug!(app = %self.name, routes = table.len(), blueprints = blueprint_hooks.len(), "Route table built");

        Ok(Application {
            name: self.name,
            table,
            before_request: self.before_request,
            after_request: self.after_request,
            blueprint_hooks,
            worker_start: self.worker_start,
            worker_stop: self.worker_stop,
            group_router: self.group_router,
        })
    }
}

/// Immutable, validated application.
pub struct Application {
    name: String,
    table: RouteTable,
    before_request: Vec<BeforeRequestHook>,
    after_request: Vec<AfterRequestHook>,
    blueprint_hooks: HashMap<Arc<str>, BlueprintHooks>,
    worker_start: Vec<WorkerHook>,
    worker_stop: Vec<WorkerHook>,
    group_router: Option<GroupRouter>,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolve(&self, cmd: Cmd) -> Option<&Route> {
        self.table.resolve(cmd)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.table
    }

    pub fn blueprints(&self) -> impl Iterator<Item = &str> {
        self.blueprint_hooks.keys().map(|name| &**name)
    }

    /// Group chosen by the router, `None` when no router is installed.
    pub fn route_group(&self, env: &Envelope) -> Option<GroupId> {
        self.group_router.as_ref().map(|router| router(env))
    }

    /// Application hooks followed by the blueprint's own hooks.
    pub(crate) fn before_request_hooks<'a>(
        &'a self,
        blueprint: Option<&str>,
    ) -> impl Iterator<Item = &'a BeforeRequestHook> + 'a {
        let scoped = blueprint
            .and_then(|name| self.blueprint_hooks.get(name))
            .map(|hooks| hooks.before_request.iter())
            .into_iter()
            .flatten();
        self.before_request.iter().chain(scoped)
    }

    /// Blueprint hooks first, then application hooks.
    pub(crate) fn after_request_hooks<'a>(
        &'a self,
        blueprint: Option<&str>,
    ) -> impl Iterator<Item = &'a AfterRequestHook> + 'a {
        let scoped = blueprint
            .and_then(|name| self.blueprint_hooks.get(name))
            .map(|hooks| hooks.after_request.iter())
            .into_iter()
            .flatten();
        scoped.chain(self.after_request.iter())
    }

    pub(crate) fn worker_started(&self, ctx: &WorkerContext) {
        for hook in &self.worker_start {
            hook(ctx);
        }
    }

    pub(crate) fn worker_stopped(&self, ctx: &WorkerContext) {
        for hook in &self.worker_stop {
            hook(ctx);
        }
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("cmds", &self.table.cmds())
            .field("blueprints", &self.blueprints().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{RouteOwner, handler_fn};

    fn noop() -> impl Handler {
        handler_fn(|_req: &mut Request| Ok(()))
    }

    #[test]
    fn every_registered_cmd_resolves_to_its_route() {
        let app = Application::builder()
            .register(1, noop())
            .register_blueprint(Blueprint::new("users").register(10, noop()).register(11, noop()))
            .register_blueprint(Blueprint::new("orders").register(20, noop()))
            .build()
            .unwrap();

        assert_eq!(app.resolve(1).unwrap().blueprint(), None);
        assert_eq!(app.resolve(10).unwrap().blueprint(), Some("users"));
        assert_eq!(app.resolve(11).unwrap().cmd(), 11);
        assert_eq!(app.resolve(20).unwrap().blueprint(), Some("orders"));
        for missing in [0, 2, 12, 21, u32::MAX] {
            assert!(app.resolve(missing).is_none());
        }
    }

    #[test]
    fn duplicate_in_application_fails_build() {
        let err = Application::builder()
            .register(1, noop())
            .register(1, noop())
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            BuildError::DuplicateRoute(DuplicateRouteError {
                cmd: 1,
                first: RouteOwner::Application,
                second: RouteOwner::Application,
            })
        );
    }

    #[test]
    fn duplicate_within_blueprint_fails_build() {
        let err = Application::builder()
            .register_blueprint(Blueprint::new("a").register(3, noop()).register(3, noop()))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateRoute(DuplicateRouteError { cmd: 3, .. })));
    }

    #[test]
    fn duplicate_split_between_app_and_blueprint_fails_build() {
        let err = Application::builder()
            .register_blueprint(Blueprint::new("a").register(7, noop()))
            .register(7, noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateRoute(DuplicateRouteError { cmd: 7, .. })));
    }

    #[test]
    fn two_blueprints_claiming_same_cmd_fail_in_either_order() {
        for flipped in [false, true] {
            let (first, second) = (
                Blueprint::new("left").register(42, noop()),
                Blueprint::new("right").register(42, noop()),
            );
            let (first, second) = if flipped { (second, first) } else { (first, second) };
            let err = Application::builder()
                .register_blueprint(first)
                .register_blueprint(second)
                .build()
                .unwrap_err();
            assert!(matches!(err, BuildError::DuplicateRoute(DuplicateRouteError { cmd: 42, .. })));
        }
    }

    #[test]
    fn merge_order_does_not_change_table() {
        let build = |flip: bool| {
            let a = Blueprint::new("a").register(1, noop());
            let b = Blueprint::new("b").register(2, noop());
            let (x, y) = if flip { (b, a) } else { (a, b) };
            Application::builder()
                .register_blueprint(x)
                .register_blueprint(y)
                .build()
                .unwrap()
        };
        let (one, two) = (build(false), build(true));
        assert_eq!(one.routes().cmds(), two.routes().cmds());
        assert_eq!(one.resolve(1).unwrap().blueprint(), two.resolve(1).unwrap().blueprint());
    }

    #[test]
    fn duplicate_blueprint_name_fails_build() {
        let err = Application::builder()
            .register_blueprint(Blueprint::new("a").register(1, noop()))
            .register_blueprint(Blueprint::new("a").register(2, noop()))
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::DuplicateBlueprint("a".to_string()));
    }

    #[test]
    fn group_router_is_optional() {
        let plain = Application::builder().build().unwrap();
        assert!(plain.route_group(&Envelope::new(1, Vec::new())).is_none());

        let routed = Application::builder()
            .group_router(|env: &Envelope| {
                if env.cmd < 20 {
                    GroupId::from("a")
                } else {
                    GroupId::from("b")
                }
            })
            .build()
            .unwrap();
        assert_eq!(
            routed.route_group(&Envelope::new(10, Vec::new())),
            Some(GroupId::from("a"))
        );
        assert_eq!(
            routed.route_group(&Envelope::new(20, Vec::new())),
            Some(GroupId::from("b"))
        );
    }
}
