//! `/command` and `/query`: request parameters in, queue submissions out.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query as QueryParams, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use moult_cqrs::{Arguments, BusError, Command, Query, ReplyError, Value};
use tracing::{debug, warn};

use super::FrontEndState;

type Params = QueryParams<Vec<(String, String)>>;

/// `GET /command?cmd=<name>&...` submits a command and returns at once.
pub async fn command_handler(
    State(state): State<Arc<FrontEndState>>,
    QueryParams(params): Params,
) -> Response {
    let Some((name, args)) = split_request(params, "cmd") else {
        return (StatusCode::BAD_REQUEST, "missing cmd parameter").into_response();
    };

    debug!(command = %name, args = args.len(), "Submitting command");
    match state.commands.submit(Command::new(name, args)) {
        Ok(()) => (StatusCode::ACCEPTED, "accepted").into_response(),
        Err(e) => {
            warn!(error = %e, "Command rejected");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// `GET /query?q=<name>&...` submits a query and waits for its result.
pub async fn query_handler(
    State(state): State<Arc<FrontEndState>>,
    QueryParams(params): Params,
) -> Response {
    let Some((name, args)) = split_request(params, "q") else {
        return (StatusCode::BAD_REQUEST, "missing q parameter").into_response();
    };

    debug!(query = %name, args = args.len(), "Submitting query");
    let (query, reply) = Query::new(name, args);
    if let Err(e) = state.queries.submit(query) {
        warn!(error = %e, "Query rejected");
        return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
    }

    tokio::select! {
        biased;
        result = reply.wait() => query_response(result),
        _ = state.stop.cancelled() => {
            (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response()
        }
    }
}

fn query_response(result: Result<Result<Value, BusError>, ReplyError>) -> Response {
    match result {
        Ok(Ok(value)) => (StatusCode::OK, value.to_string()).into_response(),
        Ok(Err(e @ BusError::NotRegistered(_))) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Pull the item name out of `params` and convert the rest to arguments.
///
/// A parameter given once becomes an int if it parses as one and a string
/// otherwise. A repeated parameter becomes a string list.
fn split_request(params: Vec<(String, String)>, name_key: &str) -> Option<(String, Arguments)> {
    let mut name = None;
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (key, value) in params {
        if key == name_key {
            name.get_or_insert(value);
        } else {
            grouped.entry(key).or_default().push(value);
        }
    }

    let name = name.filter(|n| !n.is_empty())?;
    let args = grouped
        .into_iter()
        .map(|(key, mut values)| {
            let value = if values.len() == 1 {
                let single = values.remove(0);
                match single.parse::<i64>() {
                    Ok(n) => Value::Int(n),
                    Err(_) => Value::Str(single),
                }
            } else {
                Value::List(values)
            };
            (key, value)
        })
        .collect();

    Some((name, args))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parameter_conversion() {
        let (name, args) = split_request(
            pairs(&[
                ("q", "report"),
                ("a", "3"),
                ("who", "world"),
                ("tag", "x"),
                ("tag", "7"),
            ]),
            "q",
        )
        .unwrap();

        assert_eq!(name, "report");
        assert_eq!(args.get_int("a"), Ok(3));
        assert_eq!(args.get_str("who"), Ok("world"));
        assert_eq!(args.get_list("tag").unwrap(), ["x", "7"]);
        assert!(!args.contains("q"));
    }

    #[test]
    fn test_missing_or_empty_name() {
        assert!(split_request(pairs(&[("a", "1")]), "cmd").is_none());
        assert!(split_request(pairs(&[("cmd", "")]), "cmd").is_none());
    }

    #[tokio::test]
    async fn test_multiply_query() {
        let h = harness();
        let (status, body) = get(h.app, "/query?q=multiply&a=3&b=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "15");
    }

    #[tokio::test]
    async fn test_echo_query() {
        let h = harness();
        let (status, body) = get(h.app, "/query?q=echo&text=hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn test_query_errors() {
        let h = harness();

        let (status, _) = get(h.app.clone(), "/query?a=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(h.app.clone(), "/query?q=divide").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "not registered: divide");

        let (status, _) = get(h.app.clone(), "/query?q=multiply&a=three&b=5").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, body) = get(h.app, "/query?q=echo&text=1&text=2").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("is not a string"), "{body}");
    }

    #[tokio::test]
    async fn test_commands_update_state() {
        let h = harness();

        for _ in 0..3 {
            let (status, _) = get(h.app.clone(), "/command?cmd=increment").await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }
        let (status, _) = get(h.app.clone(), "/command?cmd=add&n=2").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        tokio::time::timeout(Duration::from_secs(1), h.in_flight.wait_idle())
            .await
            .unwrap();
        assert_eq!(h.state.read().await.handled_commands, 5);

        let (_, body) = get(h.app, "/query?q=handled_commands").await;
        assert_eq!(body, "5");
    }

    #[tokio::test]
    async fn test_missing_cmd_is_bad_request() {
        let h = harness();
        let (status, _) = get(h.app, "/command?n=2").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_buffered_query_released_on_stop() {
        let h = harness();
        h.front.queries.pause();

        let pending = tokio::spawn(get(h.app.clone(), "/query?q=multiply&a=2&b=2"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.front.queries.buffered(), 1);

        h.front.stop.cancel();
        let (status, _) = pending.await.unwrap();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
