//! OCI registry client and the label-backed definition provider.
//!
//! Only the image configuration is ever fetched: manifest, then config
//! blob, then `config.Labels`. Anonymous Bearer token auth is performed
//! when the registry answers 401 with a `WWW-Authenticate` challenge.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;

use crate::definition::Definition;
use crate::label;
use crate::provider::{Provider, ProviderError};

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Parsed `[host/]repository[:tag|@digest]` image reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    /// Tag or digest, as given.
    pub reference: String,
}

impl Reference {
    pub fn parse(image_ref: &str) -> Result<Self, ProviderError> {
        if image_ref.is_empty() {
            return Err(ProviderError::InvalidReference(image_ref.to_string()));
        }

        let (registry, remainder) = match image_ref.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), image_ref.to_string()),
        };

        let (repository, reference) = if let Some((repo, digest)) = remainder.split_once('@') {
            (repo.to_string(), digest.to_string())
        } else {
            match remainder.rsplit_once(':') {
                // A colon inside the last path segment separates the tag.
                Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
                _ => (remainder.clone(), DEFAULT_TAG.to_string()),
            }
        };

        if repository.is_empty() || reference.is_empty() {
            return Err(ProviderError::InvalidReference(image_ref.to_string()));
        }

        // Docker Hub single-segment shorthand: `alpine` -> `library/alpine`.
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    fn base_url(&self) -> String {
        let scheme = if self.registry.starts_with("localhost")
            || self.registry.starts_with("127.0.0.1")
        {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}/v2/{}", self.registry, self.repository)
    }
}

/// Image configuration as stored in the config blob.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub config: ImageConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default, rename = "Labels")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    config: Option<Descriptor>,
    /// Present on index/list manifests only.
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Clone, Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Clone, Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

/// Minimal Distribution v2 client.
#[derive(Clone, Debug)]
pub struct RegistryClient {
    http: Client,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("oplet/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Fetches the image configuration for `image_ref`.
    pub async fn fetch_image_config(
        &self,
        image_ref: &str,
    ) -> Result<ImageConfigFile, ProviderError> {
        let reference = Reference::parse(image_ref)?;
        tracing::debug!(
            image_ref,
            registry = %reference.registry,
            repository = %reference.repository,
            "fetching image config from registry"
        );

        let manifest_url = format!("{}/manifests/{}", reference.base_url(), reference.reference);
        let (response, token) = self
            .get_with_auth(&manifest_url, MANIFEST_ACCEPT, None, image_ref)
            .await?;
        let mut manifest: Manifest = response
            .json()
            .await
            .map_err(|err| ProviderError::UnsupportedFormat(err.to_string()))?;

        // Multi-platform index: follow the first referenced manifest.
        if manifest.config.is_none() {
            let Some(child) = manifest.manifests.first() else {
                return Err(ProviderError::UnsupportedFormat(format!(
                    "manifest for '{image_ref}' carries neither config nor sub-manifests"
                )));
            };
            let child_url = format!("{}/manifests/{}", reference.base_url(), child.digest);
            let (response, _) = self
                .get_with_auth(&child_url, MANIFEST_ACCEPT, token.as_deref(), image_ref)
                .await?;
            manifest = response
                .json()
                .await
                .map_err(|err| ProviderError::UnsupportedFormat(err.to_string()))?;
        }

        let Some(config) = manifest.config else {
            return Err(ProviderError::UnsupportedFormat(format!(
                "manifest for '{image_ref}' has no config descriptor"
            )));
        };

        let blob_url = format!("{}/blobs/{}", reference.base_url(), config.digest);
        let (response, _) = self
            .get_with_auth(&blob_url, "application/json", token.as_deref(), image_ref)
            .await?;
        response
            .json()
            .await
            .map_err(|err| ProviderError::UnsupportedFormat(err.to_string()))
    }

    /// Issues a GET, resolving an anonymous Bearer token when challenged.
    /// Returns the successful response together with the token in use so
    /// follow-up requests can skip the challenge round-trip.
    async fn get_with_auth(
        &self,
        url: &str,
        accept: &str,
        token: Option<&str>,
        image_ref: &str,
    ) -> Result<(Response, Option<String>), ProviderError> {
        let response = self
            .get(url, accept, token)
            .await
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;

        if response.status() == StatusCode::UNAUTHORIZED && token.is_none() {
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(challenge) = challenge {
                let fresh = self.anonymous_token(&challenge).await?;
                let response = self
                    .get(url, accept, Some(&fresh))
                    .await
                    .map_err(|err| ProviderError::Unavailable(err.to_string()))?;
                return Ok((check_status(response, image_ref)?, Some(fresh)));
            }
        }

        Ok((check_status(response, image_ref)?, token.map(str::to_string)))
    }

    async fn get(
        &self,
        url: &str,
        accept: &str,
        token: Option<&str>,
    ) -> Result<Response, reqwest::Error> {
        let mut request = self.http.get(url).header(header::ACCEPT, accept);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await
    }

    async fn anonymous_token(&self, challenge: &str) -> Result<String, ProviderError> {
        let params = parse_challenge(challenge);
        let Some(realm) = params.get("realm") else {
            return Err(ProviderError::Unavailable(format!(
                "unsupported auth challenge: {challenge}"
            )));
        };

        let mut request = self.http.get(realm);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service)]);
        }
        if let Some(scope) = params.get("scope") {
            request = request.query(&[("scope", scope)]);
        }

        let token: TokenResponse = request
            .send()
            .await
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?
            .json()
            .await
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;

        if !token.token.is_empty() {
            Ok(token.token)
        } else if !token.access_token.is_empty() {
            Ok(token.access_token)
        } else {
            Err(ProviderError::Unavailable(
                "token endpoint returned no token".to_string(),
            ))
        }
    }
}

fn check_status(response: Response, image_ref: &str) -> Result<Response, ProviderError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(ProviderError::NotFound(image_ref.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::NotFound(
            format!("{image_ref} (registry denied access)"),
        )),
        status => Err(ProviderError::Unavailable(format!(
            "registry answered {status} for '{image_ref}'"
        ))),
    }
}

/// Parses `Bearer realm="…",service="…",scope="…"` into its parameters.
fn parse_challenge(challenge: &str) -> HashMap<String, String> {
    let trimmed = challenge
        .strip_prefix("Bearer ")
        .or_else(|| challenge.strip_prefix("bearer "))
        .unwrap_or(challenge);
    trimmed
        .split(',')
        .filter_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            Some((key.to_string(), value.trim_matches('"').to_string()))
        })
        .collect()
}

/// `Provider` backed by the registry client and the label parser.
#[derive(Clone, Debug, Default)]
pub struct OciProvider {
    registry: RegistryClient,
}

impl OciProvider {
    pub fn new() -> Self {
        Self {
            registry: RegistryClient::new(),
        }
    }
}

#[async_trait]
impl Provider for OciProvider {
    async fn fetch_definition(&self, image_ref: &str) -> Result<Definition, ProviderError> {
        let config_file = self.registry.fetch_image_config(image_ref).await?;
        let labels = config_file.config.labels.unwrap_or_default();
        tracing::debug!(
            image_ref,
            label_count = labels.len(),
            "extracted labels from image config"
        );

        let parsed = label::parse_labels(&labels)?;
        let definition = label::build_definition(&parsed, image_ref)?;
        tracing::info!(
            image_ref,
            task_name = %definition.name,
            input_count = definition.inputs.len(),
            config_count = definition.configuration.len(),
            "fetched task definition"
        );
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fully_qualified_reference() {
        let reference = Reference::parse("registry.example.com:5000/team/app:v2").unwrap();
        assert_eq!(reference.registry, "registry.example.com:5000");
        assert_eq!(reference.repository, "team/app");
        assert_eq!(reference.reference, "v2");
    }

    #[test]
    fn defaults_registry_tag_and_library() {
        let reference = Reference::parse("alpine").unwrap();
        assert_eq!(reference.registry, DEFAULT_REGISTRY);
        assert_eq!(reference.repository, "library/alpine");
        assert_eq!(reference.reference, "latest");
    }

    #[test]
    fn parses_digest_reference() {
        let reference =
            Reference::parse("ghcr.io/acme/task@sha256:0123456789abcdef").unwrap();
        assert_eq!(reference.registry, "ghcr.io");
        assert_eq!(reference.repository, "acme/task");
        assert_eq!(reference.reference, "sha256:0123456789abcdef");
    }

    #[test]
    fn empty_reference_is_invalid() {
        assert!(matches!(
            Reference::parse(""),
            Err(ProviderError::InvalidReference(_))
        ));
    }

    #[test]
    fn localhost_uses_plain_http() {
        let reference = Reference::parse("localhost:5000/demo/task:dev").unwrap();
        assert!(reference.base_url().starts_with("http://localhost:5000/"));
    }

    #[test]
    fn challenge_parameters_are_extracted() {
        let params = parse_challenge(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\",scope=\"repository:library/alpine:pull\"",
        );
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/alpine:pull");
    }
}
