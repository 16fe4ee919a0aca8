use reqwest::{Client, Response, StatusCode};

use crate::error::{Kind, Result};

/// Builds a URL for `path` under `base`, inserting the API version segment.
/// `base` is expected without a trailing slash, e.g.
/// `https://archive.example.test/api`.
pub fn make_url(base: &str, version: &str, path: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), version, path.trim_start_matches('/'))
}

/// Sends a bearer-authenticated GET, retrying once against `older_version` if
/// the first attempt against `version` comes back 404 or 5xx.
///
/// Mirrors `peoci::ocidist::auth_and_retry`'s shape: one request-send wrapped
/// with exactly one conditional retry under different parameters, so callers
/// never have to duplicate the fallback logic themselves.
pub async fn get_with_version_fallback(
    client: &Client,
    base: &str,
    version: &str,
    older_version: &str,
    path: &str,
    query: &[(&str, &str)],
    bearer: &str,
) -> Result<Response> {
    let url = make_url(base, version, path);
    let response = send_get(client, &url, query, bearer).await?;

    if response.status() == StatusCode::NOT_FOUND || response.status().is_server_error() {
        let fallback_url = make_url(base, older_version, path);
        return send_get(client, &fallback_url, query, bearer).await;
    }

    Ok(response)
}

async fn send_get(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
    bearer: &str,
) -> Result<Response> {
    client
        .get(url)
        .query(query)
        .bearer_auth(bearer)
        .send()
        .await
        .map_err(Kind::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_versioned_url() {
        let url = make_url("https://example.test/api", "v2", "/series/metadata");
        assert_eq!(url, "https://example.test/api/v2/series/metadata");
    }

    #[test]
    fn builds_versioned_url_without_leading_slash_on_path() {
        let url = make_url("https://example.test/api", "v1", "series/metadata");
        assert_eq!(url, "https://example.test/api/v1/series/metadata");
    }

    #[test]
    fn trims_trailing_slash_on_base() {
        let url = make_url("https://example.test/api/", "v2", "series/metadata");
        assert_eq!(url, "https://example.test/api/v2/series/metadata");
    }
}
