use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::{
    errors::Error as DockerError,
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        BuildImageOptionsBuilder, CreateContainerOptions, InspectContainerOptions,
        ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
        StatsOptionsBuilder, StopContainerOptions,
    },
    Docker,
};
use futures_util::{StreamExt, TryStreamExt};

use crate::runtime::{
    helpers::{build_port_binding, calculate_cpu_percent, format_env, map_status, network_bytes},
    ContainerDetails, ContainerResourceUsage, ContainerRuntime, ContainerRuntimeError,
    ContainerSpec, DEPLOYMENT_LABEL,
};

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, ContainerRuntimeError> {
        let docker =
            Docker::connect_with_defaults().map_err(|err| ContainerRuntimeError::Connection {
                context: "connect",
                source: err.into(),
            })?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(
        &self,
        project_dir: &Path,
        tag: &str,
    ) -> Result<String, ContainerRuntimeError> {
        let context = tar_build_context(project_dir.to_path_buf())
            .await
            .map_err(|err| ContainerRuntimeError::BuildImage {
                tag: tag.to_string(),
                message: format!("failed to assemble build context: {err}"),
                log: String::new(),
            })?;

        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(tag)
            .rm(true)
            .build();

        let mut stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(context.into())));

        let mut log = String::new();
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|err| map_build_error(err, tag, &log))?;
            if let Some(chunk) = info.stream {
                log.push_str(&chunk);
            }
            if let Some(message) = info.error {
                return Err(ContainerRuntimeError::BuildImage {
                    tag: tag.to_string(),
                    message,
                    log,
                });
            }
        }

        Ok(tag.to_string())
    }

    async fn start_container(&self, spec: ContainerSpec) -> Result<String, ContainerRuntimeError> {
        let env = format_env(&spec.env);
        let (port_bindings, exposed_ports) = build_port_binding(spec.port);

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let container_config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env,
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.iter().cloned().collect())
            },
            ..Default::default()
        };

        let create_opts = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        let created = self
            .docker
            .create_container(Some(create_opts), container_config)
            .await
            .map_err(|err| {
                map_connection_or(err, "create_container", |source| {
                    ContainerRuntimeError::CreateContainer {
                        name: spec.name.clone(),
                        source: source.into(),
                    }
                })
            })?;

        if let Err(err) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            // A created-but-never-started container keeps its name reserved;
            // drop it before reporting the failure.
            let _ = self.remove_container(&created.id).await;
            return Err(map_docker_error(
                err,
                &created.id,
                "start_container",
                |id, source| ContainerRuntimeError::StartContainer {
                    id,
                    source: source.into(),
                },
            ));
        }

        Ok(created.id)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, ContainerRuntimeError> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| {
                map_docker_error(err, id, "inspect_container", |id, source| {
                    ContainerRuntimeError::InspectContainer {
                        id,
                        source: source.into(),
                    }
                })
            })?;

        let status = map_status(details.state.as_ref());
        let name = details.name.map(|n| n.trim_start_matches('/').to_string());
        let id = details.id.unwrap_or_else(|| id.to_string());
        let labels = details.config.and_then(|c| c.labels);

        Ok(ContainerDetails {
            id,
            name,
            status,
            labels,
        })
    }

    async fn container_stats(
        &self,
        id: &str,
    ) -> Result<ContainerResourceUsage, ContainerRuntimeError> {
        let mut stream = self
            .docker
            .stats(
                id,
                Some(
                    StatsOptionsBuilder::default()
                        .stream(false)
                        .one_shot(true)
                        .build(),
                ),
            )
            .take(1);

        let stats = stream
            .try_next()
            .await
            .map_err(|err| {
                map_docker_error(err, id, "container_stats", |id, source| {
                    ContainerRuntimeError::Stats {
                        id,
                        source: source.into(),
                    }
                })
            })?
            .ok_or_else(|| ContainerRuntimeError::NotFound { id: id.to_string() })?;

        Ok(ContainerResourceUsage {
            collected_at: chrono::Utc::now(),
            cpu_percent: calculate_cpu_percent(&stats).unwrap_or_default(),
            memory_bytes: stats
                .memory_stats
                .as_ref()
                .and_then(|mem| mem.usage)
                .unwrap_or_default(),
            network_rx_bytes: network_bytes(&stats, |net| net.rx_bytes),
            network_tx_bytes: network_bytes(&stats, |net| net.tx_bytes),
        })
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        match self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    signal: None,
                    t: Some(10),
                }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_modified(&err) => Ok(()),
            Err(err) => Err(map_docker_error(err, id, "stop_container", |id, source| {
                ContainerRuntimeError::StopContainer {
                    id,
                    source: source.into(),
                }
            })),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    v: false,
                    force: true,
                    link: false,
                }),
            )
            .await
            .map_err(|err| {
                map_docker_error(err, id, "remove_container", |id, source| {
                    ContainerRuntimeError::RemoveContainer {
                        id,
                        source: source.into(),
                    }
                })
            })
    }

    async fn list_managed_containers(
        &self,
    ) -> Result<Vec<ContainerDetails>, ContainerRuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![DEPLOYMENT_LABEL.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|err| {
                map_connection_or(err, "list_containers", |source| {
                    ContainerRuntimeError::ListContainers(source.into())
                })
            })?;

        let mut details = Vec::new();
        for id in containers.iter().filter_map(|c| c.id.as_ref()) {
            match self.inspect_container(id).await {
                Ok(info) => details.push(info),
                Err(ContainerRuntimeError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(details)
    }

    async fn list_bound_host_ports(&self) -> Result<HashSet<u16>, ContainerRuntimeError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|err| {
                map_connection_or(err, "list_containers", |source| {
                    ContainerRuntimeError::ListContainers(source.into())
                })
            })?;

        let mut bound = HashSet::new();
        for container in containers {
            let Some(ports) = container.ports else {
                continue;
            };
            for port in ports {
                if let Some(public) = port.public_port {
                    bound.insert(public);
                }
            }
        }

        Ok(bound)
    }
}

/// Tar the project directory so it can stream to the daemon as a build
/// context. Runs on the blocking pool; project trees can be large.
async fn tar_build_context(project_dir: PathBuf) -> anyhow::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &project_dir)?;
        Ok(builder.into_inner()?)
    })
    .await?
}

fn map_connection_or<F>(err: DockerError, context: &'static str, wrap: F) -> ContainerRuntimeError
where
    F: FnOnce(DockerError) -> ContainerRuntimeError,
{
    if is_connection_error(&err) {
        ContainerRuntimeError::Connection {
            context,
            source: err.into(),
        }
    } else {
        wrap(err)
    }
}

fn map_docker_error<F>(
    err: DockerError,
    id: &str,
    context: &'static str,
    wrap: F,
) -> ContainerRuntimeError
where
    F: FnOnce(String, DockerError) -> ContainerRuntimeError,
{
    if is_not_found(&err) {
        ContainerRuntimeError::NotFound { id: id.to_string() }
    } else if is_connection_error(&err) {
        ContainerRuntimeError::Connection {
            context,
            source: err.into(),
        }
    } else {
        wrap(id.to_string(), err)
    }
}

fn map_build_error(err: DockerError, tag: &str, log: &str) -> ContainerRuntimeError {
    if is_connection_error(&err) {
        ContainerRuntimeError::Connection {
            context: "build_image",
            source: err.into(),
        }
    } else {
        ContainerRuntimeError::BuildImage {
            tag: tag.to_string(),
            message: err.to_string(),
            log: log.to_string(),
        }
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn is_connection_error(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::IOError { .. }
            | DockerError::HyperResponseError { .. }
            | DockerError::RequestTimeoutError
            | DockerError::SocketNotFoundError(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tar_build_context_packs_directory_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").expect("write");
        std::fs::write(dir.path().join("app.py"), "print('hi')\n").expect("write");

        let bytes = tar_build_context(dir.path().to_path_buf())
            .await
            .expect("tar context");

        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .expect("entries")
            .map(|e| {
                e.expect("entry")
                    .path()
                    .expect("path")
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
        assert!(names.iter().any(|n| n.ends_with("app.py")));
    }

    #[test]
    fn docker_404_maps_to_not_found() {
        let err = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        let mapped = map_docker_error(err, "missing", "inspect_container", |id, source| {
            ContainerRuntimeError::InspectContainer {
                id,
                source: source.into(),
            }
        });
        assert!(mapped.is_not_found());
    }

    #[test]
    fn docker_304_counts_as_already_stopped() {
        let err = DockerError::DockerResponseServerError {
            status_code: 304,
            message: "container already stopped".into(),
        };
        assert!(is_not_modified(&err));
    }
}
