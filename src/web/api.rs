use serde_json::json;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::reload::ReloadReport;
use crate::state::AppState;

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    // Plugin endpoints
    let plugins = plugins_route(state.clone());

    // Route table endpoint
    let route_table = route_table(state.clone());

    // Metrics endpoint
    let metrics = metrics_route(state.clone());

    // Reload endpoint
    let reload = reload_route(state);

    warp::path("api").and(plugins.or(route_table).or(metrics).or(reload))
}

fn plugins_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("plugins")
        .and(warp::get())
        .and(with_state(state))
        .and_then(list_plugins)
}

fn route_table(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("routes")
        .and(warp::get())
        .and(with_state(state))
        .and_then(list_routes)
}

fn metrics_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_metrics)
}

fn reload_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("reload")
        .and(warp::post())
        .and(with_state(state))
        .and_then(reload)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

async fn list_plugins(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let plugins: Vec<_> = state.launcher.active().iter().map(|d| d.summary()).collect();
    let failures = state.launcher.failures();

    Ok(warp::reply::json(&json!({
        "plugins": plugins,
        "failures": failures,
    })))
}

async fn list_routes(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let registry = state.current_registry();

    Ok(warp::reply::json(&json!({
        "generation": registry.generation(),
        "mode": registry.mode(),
        "routes": registry.views(),
    })))
}

async fn get_metrics(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::with_header(
        state.metrics.gather(),
        "content-type",
        "text/plain; version=0.0.4",
    ))
}

async fn reload(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let reply = match state.reload.reload().await {
        Ok(report) if report.is_complete() => {
            warp::reply::with_status(warp::reply::json(&report), StatusCode::OK)
        }
        Ok(report) => {
            let error = ReloadReport::into_result(report.clone())
                .err()
                .map(|e| e.to_string());
            warp::reply::with_status(
                warp::reply::json(&json!({ "error": error, "report": report })),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
        Err(e) => warp::reply::with_status(
            warp::reply::json(&json!({ "error": e.to_string() })),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    };
    Ok(reply)
}
