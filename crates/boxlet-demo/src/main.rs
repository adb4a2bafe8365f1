//! Demo application: two blueprints served by two worker groups.
//!
//! cmd 1..99 go to the `fast` group, cmd 100 and up to `slow`.
//!
//! ```text
//! BOXLET_PORT=7700 BOXLET_ADMIN_PORT=7701 BOXLET_ADMIN_TOKEN=dev cargo run -p boxlet-demo
//! ```

use std::time::Duration;

use boxlet::{
    Application, ApplicationBuilder, Blueprint, Envelope, GroupId, Handler, MasterConfig, Reply,
    ReplyPatch, Request, WorkerGroup, handler_fn,
};

const ECHO: u32 = 1;
const UPPER: u32 = 2;
const SUM: u32 = 100;
const SLOW: u32 = 101;

/// Replies after the number of milliseconds given in the body.
struct Slow;

#[async_trait::async_trait]
impl Handler for Slow {
    async fn handle(&self, req: &mut Request) -> anyhow::Result<Reply> {
        let millis: u64 = req.json()?;
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(Reply::body(format!("slept {}ms", millis)))
    }
}

fn text() -> Blueprint {
    Blueprint::new("text")
        .register(ECHO, handler_fn(|req: &mut Request| Ok(req.body().to_vec())))
        .register(
            UPPER,
            handler_fn(|req: &mut Request| {
                let text = std::str::from_utf8(req.body())?;
                Ok(text.to_uppercase())
            }),
        )
}

fn math() -> Blueprint {
    Blueprint::new("math")
        .before_request(|req: &mut Request| {
            if req.body().is_empty() {
                req.interrupt(ReplyPatch::new().ret(1).body("empty body"));
            }
            Ok(())
        })
        .register(
            SUM,
            handler_fn(|req: &mut Request| {
                let numbers: Vec<f64> = req.json()?;
                Reply::json(&numbers.iter().sum::<f64>())
            }),
        )
        .register(SLOW, Slow)
}

fn application() -> ApplicationBuilder {
    Application::builder()
        .name("boxlet-demo")
        .register_blueprint(text())
        .register_blueprint(math())
        .after_request(|req, err| {
            if let Some(err) = err {
                tracing::warn!(task_id = req.task_id(), error = %err, "Request failed");
            }
        })
        .on_worker_start(|ctx| tracing::info!(group = %ctx.group, index = ctx.index, "Demo worker up"))
        .group_router(|env: &Envelope| {
            if env.cmd >= SUM {
                GroupId::from("slow")
            } else {
                GroupId::from("fast")
            }
        })
}

fn main() -> anyhow::Result<()> {
    let mut config = MasterConfig::from_env()?;
    if std::env::var_os("BOXLET_GROUPS").is_none() {
        config = config.with_groups(vec![WorkerGroup::new("fast", 2), WorkerGroup::new("slow", 1)]);
    }
    boxlet::run(application(), config)
}
