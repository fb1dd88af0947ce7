use std::fmt::Display;
use std::future::Future;
use tracing::warn;

/// Which of the two concurrent requests produced a resolved value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Live,
    Static,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Live => "live",
            Source::Static => "static",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub source: Source,
}

/// Run `live` and `fallback` concurrently and prefer the live answer.
///
/// The fallback value is used only when the live request fails. When both
/// fail the live error is returned.
pub async fn resolve<T, E, L, F>(live: L, fallback: F) -> Result<Resolved<T>, E>
where
    L: Future<Output = Result<T, E>>,
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let (live, fallback) = tokio::join!(live, fallback);

    match (live, fallback) {
        (Ok(value), _) => Ok(Resolved {
            value,
            source: Source::Live,
        }),
        (Err(live_error), Ok(value)) => {
            warn!(error = %live_error, "Live request failed, using static fallback");
            Ok(Resolved {
                value,
                source: Source::Static,
            })
        }
        (Err(live_error), Err(fallback_error)) => {
            warn!(
                error = %live_error,
                fallback_error = %fallback_error,
                "Live request and static fallback both failed"
            );
            Err(live_error)
        }
    }
}
