//! Patch operations for the two injection modes
//!
//! Preload mode stages libfaketime through an init container into a shared
//! `emptyDir` and points every application container at it. Process mode
//! appends a sidecar that adjusts the clock of a named process and turns on
//! process namespace sharing so the sidecar can see it.

use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, Volume, VolumeMount,
};

use crate::patch::add;

use super::timespec::{FakeTimeSpec, ProcessDelay};

/// Shared volume holding the staged library
pub const VOLUME_NAME: &str = "faketime";
/// Init container that copies libfaketime into the volume
pub const INIT_CONTAINER_NAME: &str = "libfaketime";
/// Sidecar running the clock-adjusting process
pub const SIDECAR_CONTAINER_NAME: &str = "fake-time-sidecar";
/// Mount point of the shared volume
pub const LIBFAKETIME_MOUNT_PATH: &str = "/usr/local/lib/faketime";
/// Library preloaded into application containers
pub const LIBFAKETIME_PATH: &str = "/usr/local/lib/faketime/libfaketime.so.1";
/// Container env var copied into the sidecar when present
pub const MODIFY_SUB_PROCESS_ENV: &str = "Modify_Sub_Process";

const PULL_ALWAYS: &str = "Always";
const ENV_LD_PRELOAD: &str = "LD_PRELOAD";
const ENV_FAKETIME: &str = "FAKETIME";

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn faketime_mount() -> VolumeMount {
    VolumeMount {
        name: VOLUME_NAME.to_string(),
        mount_path: LIBFAKETIME_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

/// Operations for preload mode
///
/// Volume, init container and mounts are only added when missing by name.
/// Env lists are always rewritten: existing entries minus any previous
/// `LD_PRELOAD`/`FAKETIME`, followed by the injected pair.
pub fn library_preload(
    pod: &Pod,
    fake_time: &FakeTimeSpec,
    image: &str,
) -> Result<Vec<PatchOperation>, serde_json::Error> {
    let default_spec = PodSpec::default();
    let spec = pod.spec.as_ref().unwrap_or(&default_spec);
    let mut ops = Vec::new();

    let volumes = spec.volumes.as_deref().unwrap_or_default();
    let volume = Volume {
        name: VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };
    if volumes.is_empty() {
        ops.push(add(&["spec", "volumes"], &vec![volume])?);
    } else if !volumes.iter().any(|v| v.name == VOLUME_NAME) {
        ops.push(add(&["spec", "volumes", "-"], &volume)?);
    }

    let init_containers = spec.init_containers.as_deref().unwrap_or_default();
    let init = Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some(PULL_ALWAYS.to_string()),
        volume_mounts: Some(vec![faketime_mount()]),
        ..Default::default()
    };
    if init_containers.is_empty() {
        ops.push(add(&["spec", "initContainers"], &vec![init])?);
    } else if !init_containers.iter().any(|c| c.name == INIT_CONTAINER_NAME) {
        ops.push(add(&["spec", "initContainers", "-"], &init)?);
    }

    for (index, container) in spec.containers.iter().enumerate() {
        let index = index.to_string();
        let mounts = container.volume_mounts.as_deref().unwrap_or_default();
        if mounts.is_empty() {
            ops.push(add(
                &["spec", "containers", &index, "volumeMounts"],
                &vec![faketime_mount()],
            )?);
        } else if !mounts.iter().any(|m| m.name == VOLUME_NAME) {
            ops.push(add(
                &["spec", "containers", &index, "volumeMounts", "-"],
                &faketime_mount(),
            )?);
        }
    }

    let faketime_value = fake_time.libfaketime_value();
    for (index, container) in spec.containers.iter().enumerate() {
        let index = index.to_string();
        let mut vars: Vec<EnvVar> = container
            .env
            .iter()
            .flatten()
            .filter(|e| e.name != ENV_LD_PRELOAD && e.name != ENV_FAKETIME)
            .cloned()
            .collect();
        vars.push(env(ENV_LD_PRELOAD, LIBFAKETIME_PATH));
        vars.push(env(ENV_FAKETIME, faketime_value.as_str()));
        ops.push(add(&["spec", "containers", &index, "env"], &vars)?);
    }

    Ok(ops)
}

/// Operations for process mode
///
/// The sidecar is skipped when one with the same name already exists.
pub fn process_control(
    pod: &Pod,
    process_name: &str,
    delay: ProcessDelay,
    image: &str,
) -> Result<Vec<PatchOperation>, serde_json::Error> {
    let default_spec = PodSpec::default();
    let spec = pod.spec.as_ref().unwrap_or(&default_spec);
    let mut ops = Vec::new();

    if !spec
        .containers
        .iter()
        .any(|c| c.name == SIDECAR_CONTAINER_NAME)
    {
        let mut vars = vec![
            env("modify_process_name", process_name),
            env("delay_second", delay.seconds.to_string()),
            env("delay_nanosecond", delay.nanoseconds.to_string()),
        ];

        let sub_process = spec
            .containers
            .iter()
            .flat_map(|c| c.env.iter().flatten())
            .find(|e| e.name == MODIFY_SUB_PROCESS_ENV);
        if let Some(var) = sub_process {
            vars.push(EnvVar {
                name: MODIFY_SUB_PROCESS_ENV.to_string(),
                value: var.value.clone(),
                ..Default::default()
            });
        }

        let sidecar = Container {
            name: SIDECAR_CONTAINER_NAME.to_string(),
            image: Some(image.to_string()),
            image_pull_policy: Some(PULL_ALWAYS.to_string()),
            env: Some(vars),
            ..Default::default()
        };
        ops.push(add(&["spec", "containers", "-"], &sidecar)?);
    }

    ops.push(add(&["spec", "shareProcessNamespace"], &true)?);
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some("game:v1".to_string()),
            ..Default::default()
        }
    }

    fn pod(spec: PodSpec) -> Pod {
        Pod {
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn to_json(ops: &[PatchOperation]) -> Vec<Value> {
        ops.iter().map(|op| serde_json::to_value(op).unwrap()).collect()
    }

    fn paths(ops: &[PatchOperation]) -> Vec<String> {
        to_json(ops)
            .iter()
            .map(|op| op["path"].as_str().unwrap().to_string())
            .collect()
    }

    fn offset(value: &str) -> FakeTimeSpec {
        FakeTimeSpec::parse(value).unwrap()
    }

    #[test]
    fn preload_on_bare_pod_creates_every_list() {
        let pod = pod(PodSpec {
            containers: vec![container("app"), container("worker")],
            ..Default::default()
        });

        let ops = library_preload(&pod, &offset("+1h"), "libfaketime:v1").unwrap();
        assert_eq!(
            paths(&ops),
            vec![
                "/spec/volumes",
                "/spec/initContainers",
                "/spec/containers/0/volumeMounts",
                "/spec/containers/1/volumeMounts",
                "/spec/containers/0/env",
                "/spec/containers/1/env",
            ]
        );

        let json = to_json(&ops);
        assert_eq!(json[0]["value"][0]["name"], VOLUME_NAME);
        assert!(json[0]["value"][0]["emptyDir"].is_object());
        assert_eq!(json[1]["value"][0]["image"], "libfaketime:v1");
        assert_eq!(json[1]["value"][0]["imagePullPolicy"], "Always");
        assert_eq!(
            json[1]["value"][0]["volumeMounts"][0]["mountPath"],
            LIBFAKETIME_MOUNT_PATH
        );
        assert_eq!(json[4]["value"][0]["name"], "LD_PRELOAD");
        assert_eq!(json[4]["value"][0]["value"], LIBFAKETIME_PATH);
        assert_eq!(json[4]["value"][1]["name"], "FAKETIME");
        assert_eq!(json[4]["value"][1]["value"], "+3600");
    }

    #[test]
    fn preload_appends_to_existing_lists() {
        let mut app = container("app");
        app.volume_mounts = Some(vec![VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        }]);
        app.env = Some(vec![env("LOG_LEVEL", "debug")]);

        let pod = pod(PodSpec {
            containers: vec![app],
            init_containers: Some(vec![container("migrate")]),
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let ops = library_preload(&pod, &offset("-30s"), "libfaketime:v1").unwrap();
        assert_eq!(
            paths(&ops),
            vec![
                "/spec/volumes/-",
                "/spec/initContainers/-",
                "/spec/containers/0/volumeMounts/-",
                "/spec/containers/0/env",
            ]
        );

        let json = to_json(&ops);
        let env = json[3]["value"].as_array().unwrap();
        assert_eq!(env.len(), 3);
        assert_eq!(env[0]["name"], "LOG_LEVEL");
        assert_eq!(env[2]["value"], "-30");
    }

    #[test]
    fn absolute_time_is_prefixed_for_libfaketime() {
        let pod = pod(PodSpec {
            containers: vec![container("app")],
            ..Default::default()
        });
        let spec = FakeTimeSpec::parse("2024-01-02 03:04:05").unwrap();
        let ops = library_preload(&pod, &spec, "img").unwrap();
        let json = to_json(&ops);
        let env = json.last().unwrap()["value"].as_array().unwrap().clone();
        assert_eq!(env[1]["value"], "@2024-01-02 03:04:05");
    }

    /// Story: Re-running preload on a patched pod adds nothing structural
    ///
    /// A pod that already carries the volume, init container and mounts only
    /// gets its env lists rewritten, without duplicated entries.
    #[test]
    fn story_preload_is_structurally_idempotent() {
        let mut app = container("app");
        app.volume_mounts = Some(vec![faketime_mount()]);
        app.env = Some(vec![
            env("LD_PRELOAD", LIBFAKETIME_PATH),
            env("FAKETIME", "+60"),
        ]);
        let mut init = container(INIT_CONTAINER_NAME);
        init.volume_mounts = Some(vec![faketime_mount()]);

        let pod = pod(PodSpec {
            containers: vec![app],
            init_containers: Some(vec![init]),
            volumes: Some(vec![Volume {
                name: VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let ops = library_preload(&pod, &offset("+1h"), "libfaketime:v1").unwrap();
        assert_eq!(paths(&ops), vec!["/spec/containers/0/env"]);

        let json = to_json(&ops);
        let env = json[0]["value"].as_array().unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[1]["value"], "+3600");
    }

    #[test]
    fn process_mode_adds_sidecar_and_shares_namespace() {
        let mut app = container("app");
        app.env = Some(vec![env(MODIFY_SUB_PROCESS_ENV, "true")]);
        let pod = pod(PodSpec {
            containers: vec![app],
            ..Default::default()
        });

        let delay = ProcessDelay {
            seconds: 86_400,
            nanoseconds: 5,
        };
        let ops = process_control(&pod, "game-server", delay, "watchmaker:v1").unwrap();
        assert_eq!(
            paths(&ops),
            vec!["/spec/containers/-", "/spec/shareProcessNamespace"]
        );

        let json = to_json(&ops);
        let sidecar = &json[0]["value"];
        assert_eq!(sidecar["name"], SIDECAR_CONTAINER_NAME);
        assert_eq!(sidecar["image"], "watchmaker:v1");
        let env = sidecar["env"].as_array().unwrap();
        assert_eq!(env[0]["name"], "modify_process_name");
        assert_eq!(env[0]["value"], "game-server");
        assert_eq!(env[1]["value"], "86400");
        assert_eq!(env[2]["value"], "5");
        assert_eq!(env[3]["name"], MODIFY_SUB_PROCESS_ENV);
        assert_eq!(env[3]["value"], "true");
        assert_eq!(json[1]["value"], true);
    }

    #[test]
    fn process_mode_skips_existing_sidecar() {
        let pod = pod(PodSpec {
            containers: vec![container("app"), container(SIDECAR_CONTAINER_NAME)],
            ..Default::default()
        });
        let delay = ProcessDelay {
            seconds: 1,
            nanoseconds: 0,
        };
        let ops = process_control(&pod, "game-server", delay, "watchmaker:v1").unwrap();
        assert_eq!(paths(&ops), vec!["/spec/shareProcessNamespace"]);
    }
}
