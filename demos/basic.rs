//! Minimal pinion example — a guarded endpoint behind a deadline.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/                         # 401 missing credentials
//!   curl -H 'authorization: letmein' http://localhost:3000/
//!   curl -H 'authorization: letmein' 'http://localhost:3000/slow'   # 504 after 2s
//!   curl -H 'authorization: letmein' 'http://localhost:3000/a//b'   # 404, no middleware runs

use std::time::Duration;

use pinion::{App, Context, Error, Fault, Server, middleware};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let app = App::new()
        .with(middleware::timeout(Duration::from_secs(2), |ctx| {
            let _ = ctx.text(504, "service timeout");
            ctx.cancel();
        }))
        .with(auth)
        .with(respond);

    Server::bind("0.0.0.0:3000")
        .serve(app)
        .await
        .expect("server error");
}

// Returning Err stops the pipeline; the fault is classified by OnError and
// written as the response. 4xx results are not reported to the sink.
async fn auth(ctx: Context) -> Result<(), Fault> {
    match ctx.request().header("authorization") {
        Some(_) => Ok(()),
        None => Err(Error::new(401, "missing credentials").into()),
    }
}

async fn respond(ctx: Context) -> Result<(), Fault> {
    if ctx.request().path() == "/slow" {
        // Cooperative: park until the request ends. The timeout middleware
        // fires its hook at the 2s deadline and cancels the request.
        ctx.done().await;
        return Ok(());
    }

    ctx.json(200, br#"{"hello":"pinion"}"#).map_err(Fault::opaque)
}
