use std::collections::BTreeMap;
use std::sync::Arc;

use cloudhop_contract::{
    DiskLocation, DiskType, FloatingBinding, ImageRef, MigrationRequest, NetworkAttachment,
    SourceVolume, VolumeHandle, STATUS_AVAILABLE,
};
use cloudhop_services::{
    content_checksum, CloudServices, CommandOutput, DestinationCloud, DryRunTransport,
    ImageService, InMemoryCloud, SourceCloud,
};
use cloudhop_storage::{MigrationStorage, RunStatus, StorageConfig};
use cloudhop_workflow::steps::disk::merge_and_copy_to_store;
use cloudhop_workflow::steps::instance::create_instance;
use cloudhop_workflow::steps::prepare::{prepare_instance, prepare_security_groups};
use cloudhop_workflow::steps::volume::transfer_volumes_via_image_service;
use cloudhop_workflow::{
    MemoryCheckpoints, Migration, MigrationConfig, MigrationDeps, MigrationRuntime, NoCheckpoints,
    RunEvent, StepChain, WorkflowError,
};

const BASE_CONTENT: &[u8] = b"cirros base image";

struct Harness {
    source: Arc<InMemoryCloud>,
    destination: Arc<InMemoryCloud>,
    transport: Arc<DryRunTransport>,
    deps: MigrationDeps,
}

fn config(extra_source: &str, extra_destination: &str) -> MigrationConfig {
    let raw = format!(
        "[source]\ngateway = \"src-ctl\"\n{extra_source}\n\n\
         [destination]\ngateway = \"dst-ctl\"\n{extra_destination}\n\n\
         [wait]\ninterval_ms = 1\nmax_attempts = 50\n"
    );
    toml::from_str(&raw).expect("config")
}

/// `virsh domblklist` answer covering every id the in-memory cloud hands out
/// in these scenarios.
fn domblklist() -> String {
    let mut listing = String::from("Target     Source\n------------------------------\n");
    for n in 1..=9 {
        listing.push_str(&format!("vda        /var/lib/nova/instances/srv-{n}/disk\n"));
        listing.push_str(&format!("vdb        /var/lib/nova/instances/srv-{n}/disk.local\n"));
        listing.push_str(&format!(
            "vd{n}        /dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.2010-10.org.openstack:volume-vol-{n}-lun-1\n"
        ));
    }
    listing
}

fn harness(config: MigrationConfig) -> Harness {
    let source = Arc::new(InMemoryCloud::new());
    let destination = Arc::new(InMemoryCloud::new());
    let transport = Arc::new(DryRunTransport::new());

    source.add_image("img-base", "cirros", BASE_CONTENT);
    destination.add_flavor("fl-1", "m1.small");
    destination.add_tenant("ops", "tenant-ops");
    destination.add_tenant("admin", "tenant-admin");
    destination.add_security_group("sg-1", "default");
    destination.add_network("net-1", "private");
    transport.reply_to("virsh domblklist", CommandOutput::ok(domblklist()));

    let services = CloudServices {
        source: SourceCloud {
            images: source.clone(),
            volumes: source.clone(),
        },
        destination: DestinationCloud {
            compute: destination.clone(),
            volumes: destination.clone(),
            images: destination.clone(),
            network: destination.clone(),
            identity: destination.clone(),
            database: destination.clone(),
        },
        transport: transport.clone(),
    };
    Harness {
        source,
        destination,
        transport,
        deps: MigrationDeps::new(Arc::new(config), services),
    }
}

fn request() -> MigrationRequest {
    MigrationRequest {
        name: "web-01".to_string(),
        tenant_name: "ops".to_string(),
        flavor: Some("m1.small".to_string()),
        image: Some(ImageRef {
            id: "img-base".to_string(),
            checksum: content_checksum(BASE_CONTENT),
            name: "cirros".to_string(),
        }),
        metadata: Some(BTreeMap::from([("role".to_string(), "web".to_string())])),
        key: None,
        config_drive: None,
        disk_config: None,
        security_groups: Some(vec!["default".to_string()]),
        networks: vec![NetworkAttachment {
            id: None,
            name: Some("private".to_string()),
            ip: Some("192.168.10.4".to_string()),
            mac: "fa:16:3e:00:00:01".to_string(),
        }],
        volumes: Vec::new(),
        floatings: vec![FloatingBinding {
            name: "private".to_string(),
            ip: "203.0.113.7".to_string(),
        }],
        disk: DiskLocation {
            host: "src-compute".to_string(),
            path: "/var/lib/nova/instances/abc/disk".to_string(),
            disk_type: DiskType::RemoteFile,
            diff_path: Some("/var/lib/nova/instances/abc/disk".to_string()),
            diff_image: None,
            ephemeral: None,
        },
        boot_volume_size: None,
    }
}

fn source_volume(id: &str, device: &str) -> SourceVolume {
    SourceVolume {
        id: id.to_string(),
        size: 1,
        display_name: Some(format!("{id}-data")),
        display_description: None,
        volume_type: None,
        availability_zone: None,
        device: Some(device.to_string()),
        bootable: false,
        path: Some(format!(
            "/dev/disk/by-path/ip-10.1.0.5:3260-iscsi-iqn.2010-10.org.openstack:volume-{id}-lun-1"
        )),
        image: None,
    }
}

/// A request whose root disk needs no copy, so only volumes move.
fn volume_request(volumes: Vec<SourceVolume>) -> MigrationRequest {
    let mut request = request();
    request.disk.disk_type = DiskType::DistributedStore;
    request.disk.diff_path = None;
    request.floatings.clear();
    request.volumes = volumes;
    request
}

fn streams(transport: &DryRunTransport) -> Vec<String> {
    transport
        .commands_containing("set -o pipefail")
        .into_iter()
        .map(|issued| issued.command)
        .collect()
}

/// Index of the first issued command containing `needle`.
fn position(transport: &DryRunTransport, needle: &str) -> usize {
    transport
        .issued()
        .iter()
        .position(|issued| issued.command.contains(needle))
        .unwrap_or_else(|| panic!("no command containing {needle:?}"))
}

const IMAGE_CLI: &str = "[destination.image_cli]\n\
    auth_url = \"http://dst-ctl:5000/v2.0\"\n\
    user = \"admin\"\n\
    password = \"secret\"\n\
    tenant = \"admin\"\n";

#[tokio::test]
async fn file_backed_instance_is_rebuilt_on_destination() {
    let h = harness(config("", ""));

    let instance = Migration::new(&h.deps, request())
        .finish(&NoCheckpoints)
        .await
        .expect("migration");

    assert_eq!(instance.status, "ACTIVE");
    assert_eq!(h.destination.calls_starting_with("create_image").len(), 1);
    assert!(h
        .destination
        .images()
        .iter()
        .any(|image| image.name == "cirrosMigrate"));
    assert_eq!(h.destination.ports().len(), 1);
    assert_eq!(h.destination.ports()[0].mac_address, "fa:16:3e:00:00:01");

    let calls = h.destination.calls();
    let stop = calls
        .iter()
        .position(|c| c.starts_with("stop_server"))
        .expect("stopped");
    let start = calls
        .iter()
        .position(|c| c.starts_with("start_server"))
        .expect("started");
    assert!(stop < start);
    assert_eq!(
        h.destination.calls_starting_with("add_floating_ip"),
        vec![format!("add_floating_ip {} 203.0.113.7 10.0.0.10", instance.id)]
    );

    let copies = streams(&h.transport);
    assert_eq!(copies.len(), 1);
    assert!(copies[0].contains("if=/var/lib/nova/instances/abc/disk"));
    assert!(copies[0].contains(&format!("of=/var/lib/nova/instances/{}/disk", instance.id)));
}

#[tokio::test]
async fn matching_checksum_reuses_destination_image() {
    let h = harness(config("", ""));
    let existing = h.destination.add_image("img-present", "cirros", BASE_CONTENT);

    let mut migration = Migration::new(&h.deps, request());
    migration.run(&NoCheckpoints).await.expect("migration");

    assert!(h.destination.calls_starting_with("create_image").is_empty());
    assert!(h.source.calls_starting_with("download_image").is_empty());
    assert_eq!(
        migration
            .capture()
            .derived_parameters
            .image
            .map(|image| image.id),
        Some(existing.id)
    );
}

#[tokio::test]
async fn corrupted_image_copy_stops_before_instance_creation() {
    let h = harness(config("", ""));
    h.destination.corrupt_uploads(true);

    let err = Migration::new(&h.deps, request())
        .finish(&NoCheckpoints)
        .await
        .expect_err("checksum mismatch");

    assert!(matches!(err.root(), WorkflowError::ChecksumMismatch { .. }));
    assert_eq!(err.failed_step(), Some("prepare_image_from_base"));
    assert!(h.destination.calls_starting_with("create_server").is_empty());
}

#[tokio::test]
async fn boot_from_volume_swaps_image_for_block_device_mapping() {
    let h = harness(config("", ""));
    let mut request = request();
    request.boot_volume_size = Some(20);

    let mut migration = Migration::new(&h.deps, request);
    migration.run(&NoCheckpoints).await.expect("migration");

    let state = migration.capture();
    assert!(state.derived_parameters.image.is_none());
    let mapping = &state.derived_parameters.block_device_mapping;
    assert_eq!(mapping.len(), 1);
    assert_eq!(mapping[0].source_type, "image");
    assert_eq!(mapping[0].destination_type, "volume");
    assert_eq!(mapping[0].volume_size, 20);
    assert_eq!(mapping[0].boot_index, 0);
    assert!(mapping[0].delete_on_termination);

    assert!(h.destination.images().iter().all(|image| image.id != mapping[0].uuid));
    assert!(h.source.images().iter().all(|image| image.id != "img-base"));
    assert!(streams(&h.transport).is_empty());
}

#[tokio::test]
async fn iscsi_volumes_are_attached_then_streamed_once_each() {
    let h = harness(config("", ""));
    let request = volume_request(vec![
        source_volume("src-a", "/dev/vdb"),
        source_volume("src-b", "/dev/vdc"),
    ]);

    let mut migration = Migration::new(&h.deps, request);
    migration.run(&NoCheckpoints).await.expect("migration");
    let state = migration.capture();
    let instance_id = state
        .created_instance_handle
        .as_ref()
        .map(|instance| instance.id.clone())
        .expect("instance");

    let records: Vec<(String, String)> = state
        .created_volume_records
        .iter()
        .map(|record| {
            (
                record.source.id.clone(),
                record.destination.as_ref().map(|d| d.id.clone()).unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(records.len(), 2);
    assert!(state.created_volume_records.iter().all(|r| r.is_correlated()));

    assert_eq!(
        h.destination.calls_starting_with("attach_volume"),
        vec![
            format!("attach_volume {instance_id} {} /dev/vdb", records[0].1),
            format!("attach_volume {instance_id} {} /dev/vdc", records[1].1),
        ]
    );

    let copies = streams(&h.transport);
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|command| !command.contains("rbd")));
    for ((source_id, dest_id), command) in records.iter().zip(&copies) {
        assert!(command.contains(&format!("volume-{source_id}-lun-1")));
        assert!(command.contains(&format!("volume-{dest_id}-lun-1")));
    }
}

#[tokio::test]
async fn volumes_travel_through_image_catalogs_when_configured() {
    let h = harness(config("transfer_volumes_via_image_service = true", ""));
    h.source.add_volume(VolumeHandle {
        id: "src-a".to_string(),
        size: 1,
        display_name: Some("src-a-data".to_string()),
        status: STATUS_AVAILABLE.to_string(),
        bootable: false,
        metadata: BTreeMap::new(),
    });
    let mut volume = source_volume("src-a", "/dev/vdb");
    volume.bootable = true;

    let mut migration = Migration::new(&h.deps, volume_request(vec![volume]));
    migration.run(&NoCheckpoints).await.expect("migration");

    let created = h.destination.calls_starting_with("create_volume");
    assert_eq!(created.len(), 1);
    assert!(created[0].contains("image=img-"));
    assert!(h
        .destination
        .images()
        .iter()
        .all(|image| image.name != "volume-src-a-image"));
    assert!(h
        .source
        .images()
        .iter()
        .all(|image| image.name != "volume-src-a-image"));
    assert_eq!(h.destination.statements().len(), 1);
    assert!(h.destination.statements()[0].contains("bootable"));
    assert_eq!(h.destination.calls_starting_with("attach_volume").len(), 1);
    assert!(streams(&h.transport).is_empty());
}

#[tokio::test]
async fn resumed_migration_skips_completed_steps() {
    let h = harness(config("", ""));
    let mut request = request();
    request.flavor = Some("m1.large".to_string());
    let checkpoints = MemoryCheckpoints::new();

    let err = Migration::new(&h.deps, request.clone())
        .finish(&checkpoints)
        .await
        .expect_err("flavor missing");
    assert_eq!(err.failed_step(), Some("prepare_flavor"));
    assert!(matches!(err.root(), WorkflowError::FlavorNotFound(name) if name == "m1.large"));

    let (snapshot, completed) = checkpoints.latest().expect("checkpoint");
    assert!(completed
        .iter()
        .any(|step| step == "prepare_instance/prepare_image/prepare_image_from_base"));
    assert!(snapshot.derived_parameters.image.is_some());

    h.destination.add_flavor("fl-2", "m1.large");
    let instance = Migration::restore(&h.deps, snapshot, None, completed)
        .expect("restore")
        .finish(&checkpoints)
        .await
        .expect("resumed migration");

    assert_eq!(h.destination.calls_starting_with("list_images").len(), 1);
    assert_eq!(h.destination.calls_starting_with("create_image").len(), 1);
    assert_eq!(
        h.destination.calls_starting_with("create_server"),
        vec!["create_server ops web-01".to_string()]
    );
    assert_eq!(instance.name, "web-01");
}

#[tokio::test]
async fn runtime_persists_run_outcome_and_publishes_steps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = MigrationStorage::connect(&StorageConfig {
        sqlite_path: dir.path().join("cloudhop.db").display().to_string(),
    })
    .await
    .expect("storage");
    let h = harness(config("", ""));
    let runtime = MigrationRuntime::new(h.deps.clone(), storage.clone());
    let mut events = runtime.subscribe();

    let run = runtime.submit(&request(), Some("run-1")).await.expect("submit");
    let instance = runtime.execute(&run.run_id, None).await.expect("execute");

    let stored = storage.get_run("run-1").await.expect("get").expect("present");
    assert_eq!(stored.status, RunStatus::Success.as_str());
    let checkpoint = storage
        .load_checkpoint("run-1")
        .await
        .expect("load")
        .expect("checkpoint");
    assert_eq!(checkpoint.last_step.as_deref(), Some("assigning_floating"));
    assert_eq!(
        checkpoint
            .state
            .created_instance_handle
            .map(|handle| handle.id),
        Some(instance.id)
    );

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
        if let RunEvent::StepCompleted { run_id, .. } = &event {
            assert_eq!(run_id, "run-1");
        }
    }
    assert_eq!(kinds.first(), Some(&"run.status.changed"));
    assert_eq!(kinds.last(), Some(&"run.status.changed"));
    assert!(kinds.contains(&"step.completed"));
}

#[tokio::test]
async fn runtime_records_failure_reason() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = MigrationStorage::connect(&StorageConfig {
        sqlite_path: dir.path().join("cloudhop.db").display().to_string(),
    })
    .await
    .expect("storage");
    let h = harness(config("", ""));
    let runtime = MigrationRuntime::new(h.deps.clone(), storage.clone());
    let mut request = request();
    request.flavor = Some("m1.huge".to_string());

    let run = runtime.submit(&request, None).await.expect("submit");
    runtime
        .execute(&run.run_id, None)
        .await
        .expect_err("missing flavor");

    let stored = storage
        .get_run(&run.run_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(stored.status, RunStatus::Failed.as_str());
    assert!(stored
        .failure_reason
        .as_deref()
        .is_some_and(|reason| reason.starts_with("prepare_flavor:")));
}

#[tokio::test]
async fn interrupted_image_service_import_waits_on_the_volume_it_created() {
    let h = harness(config("transfer_volumes_via_image_service = true", ""));
    h.source.add_volume(VolumeHandle {
        id: "src-a".to_string(),
        size: 1,
        display_name: Some("src-a-data".to_string()),
        status: STATUS_AVAILABLE.to_string(),
        bootable: false,
        metadata: BTreeMap::new(),
    });
    // Sixty lagging polls outlast one fifty-poll wait but not two.
    h.destination.set_status_lag(60);
    let mut chain = StepChain::new();
    chain.push(transfer_volumes_via_image_service());
    let checkpoints = MemoryCheckpoints::new();

    let mut first = Migration::new(&h.deps, volume_request(vec![source_volume("src-a", "/dev/vdb")]))
        .with_chain(chain.clone());
    let err = first.run(&checkpoints).await.expect_err("volume still creating");
    assert!(matches!(err.root(), WorkflowError::Wait(_)));

    let (snapshot, completed) = checkpoints.latest().expect("checkpoint");
    let pending = snapshot.created_volume_records[0]
        .destination
        .clone()
        .expect("volume recorded before the wait");

    let mut resumed = Migration::restore(&h.deps, snapshot, None, completed)
        .expect("restore")
        .with_chain(chain);
    resumed.run(&checkpoints).await.expect("resumed import");

    assert_eq!(h.destination.calls_starting_with("create_volume").len(), 1);
    assert_eq!(h.destination.volumes().len(), 1);
    assert_eq!(h.source.calls_starting_with("upload_to_image").len(), 1);
    let record = &resumed.capture().created_volume_records[0];
    let imported = record.destination.as_ref().expect("destination");
    assert_eq!(imported.id, pending.id);
    assert_eq!(imported.status, STATUS_AVAILABLE);
    assert!(h
        .destination
        .images()
        .iter()
        .chain(h.source.images().iter())
        .all(|image| image.name != "volume-src-a-image"));
}

#[tokio::test]
async fn runtime_refuses_a_run_held_by_another_executor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = MigrationStorage::connect(&StorageConfig {
        sqlite_path: dir.path().join("cloudhop.db").display().to_string(),
    })
    .await
    .expect("storage");
    let h = harness(config("", ""));
    let runtime = MigrationRuntime::new(h.deps.clone(), storage.clone());

    let run = runtime.submit(&request(), Some("run-9")).await.expect("submit");
    assert!(storage.claim_run(&run.run_id).await.expect("claim"));

    let err = runtime
        .execute(&run.run_id, None)
        .await
        .expect_err("already held");
    assert!(err.to_string().contains("already running"));
    assert!(h.destination.calls_starting_with("create_server").is_empty());
    let stored = storage.get_run("run-9").await.expect("get").expect("present");
    assert_eq!(stored.status, RunStatus::Running.as_str());
}

#[tokio::test]
async fn store_backed_ephemeral_is_cleared_copied_then_rebased() {
    let h = harness(config("", ""));
    h.transport.reply_to(
        "qemu-img info",
        CommandOutput::ok("backing file: /var/lib/nova/instances/_base/ephemeral_1_default"),
    );
    let mut request = volume_request(Vec::new());
    request.disk.ephemeral = Some("/var/lib/nova/instances/abc/disk.local".to_string());

    let instance = Migration::new(&h.deps, request)
        .finish(&NoCheckpoints)
        .await
        .expect("migration");

    let dest = format!("/var/lib/nova/instances/{}/disk.local", instance.id);
    let query = position(&h.transport, "qemu-img info");
    let clear = position(&h.transport, &format!("rm -rf {dest}"));
    let copy = position(&h.transport, "set -o pipefail");
    let rebase = position(
        &h.transport,
        &format!("qemu-img rebase -u -b /var/lib/nova/instances/_base/ephemeral_1_default {dest}"),
    );
    assert!(query < clear && clear < copy && copy < rebase);

    let issued = h.transport.issued();
    assert_eq!(issued[query].host, "dst-ctl");
    assert!(issued[query].command.contains(&format!("qemu-img info {dest}")));
    assert!(issued[copy].command.contains(&format!("of={dest}")));
}

#[tokio::test]
async fn file_backed_ephemeral_is_copied_without_rebase() {
    let h = harness(config("", ""));
    let mut request = request();
    request.disk.ephemeral = Some("/var/lib/nova/instances/abc/disk.local".to_string());

    let instance = Migration::new(&h.deps, request)
        .finish(&NoCheckpoints)
        .await
        .expect("migration");

    let copies = streams(&h.transport);
    assert_eq!(copies.len(), 2);
    assert!(copies[1].contains(&format!(
        "of=/var/lib/nova/instances/{}/disk.local",
        instance.id
    )));
    assert!(h.transport.commands_containing("qemu-img").is_empty());
}

#[tokio::test]
async fn overlay_is_merged_into_a_new_image_before_create() {
    let h = harness(config(
        "",
        &format!("merge_delta_before_create = true\n{IMAGE_CLI}"),
    ));
    h.destination
        .add_image("img-merged", "newcirrosMigrate", b"merged root disk");
    h.transport
        .reply_to("image-create", CommandOutput::ok("| id | img-merged |"));

    let mut migration = Migration::new(&h.deps, request());
    migration.run(&NoCheckpoints).await.expect("migration");

    let base = h
        .destination
        .images()
        .into_iter()
        .find(|image| image.name == "cirrosMigrate")
        .expect("base image copied");
    let workdir = format!("/tmp/cloudhop/{}", base.id);
    let fresh = position(&h.transport, &format!("rm -rf {workdir} && mkdir -p {workdir}"));
    let stage = position(&h.transport, "set -o pipefail");
    let download = position(
        &h.transport,
        &format!("image-download {} > {workdir}/baseimage", base.id),
    );
    let rebase = position(
        &h.transport,
        &format!("qemu-img rebase -u -b {workdir}/baseimage {workdir}/disk"),
    );
    let commit = position(&h.transport, &format!("cd {workdir} && qemu-img commit disk"));
    let convert = position(&h.transport, "qemu-img convert -f qcow2 -O raw baseimage");
    let upload = position(&h.transport, "image-create --name newcirrosMigrate");
    let cleanup = h
        .transport
        .issued()
        .iter()
        .rposition(|issued| issued.command == format!("rm -rf {workdir}"))
        .expect("workdir removed");
    assert!(fresh < stage && stage < download && download < rebase);
    assert!(rebase < commit && commit < convert && convert < upload && upload < cleanup);

    let issued = h.transport.issued();
    assert!(issued[upload].command.contains("--disk-format=raw"));
    assert!(issued[stage].command.contains(&format!("of={workdir}/disk")));
    assert_eq!(streams(&h.transport).len(), 1);

    let state = migration.capture();
    assert_eq!(
        state.derived_parameters.image.as_ref().map(|image| image.id.as_str()),
        Some("img-merged")
    );
    assert!(h.destination.calls_starting_with("stop_server").is_empty());
}

#[tokio::test]
async fn overlay_is_rebuilt_into_the_compute_pool_from_its_base_image() {
    let h = harness(config("", &format!("{IMAGE_CLI}\n[ephemeral_drives]\nstore = true\n")));

    let instance = Migration::new(&h.deps, request())
        .finish(&NoCheckpoints)
        .await
        .expect("migration");

    let base = h
        .destination
        .images()
        .into_iter()
        .find(|image| image.name == "cirrosMigrate")
        .expect("base image copied");
    let workdir = format!("/tmp/cloudhop/{}", instance.id);
    let fresh = position(&h.transport, &format!("rm -rf {workdir} && mkdir -p {workdir}"));
    let stage = position(&h.transport, "set -o pipefail");
    let download = position(
        &h.transport,
        &format!("image-download {} > {workdir}/baseimage", base.id),
    );
    let rebase = position(&h.transport, "qemu-img rebase");
    let remove = position(&h.transport, &format!("rbd rm -p compute {}_disk", instance.id));
    let convert = position(
        &h.transport,
        &format!("qemu-img convert -p -O raw {workdir}/disk rbd:compute/{}_disk", instance.id),
    );
    assert!(fresh < stage && stage < download && download < rebase);
    assert!(rebase < remove && remove < convert);
    assert!(h.transport.commands_containing("qemu-img info").is_empty());
}

#[tokio::test]
async fn overlay_falls_back_to_its_backing_file_when_the_base_image_is_gone() {
    let h = harness(config("", &format!("{IMAGE_CLI}\n[ephemeral_drives]\nstore = true\n")));
    h.transport.reply_to(
        "qemu-img info",
        CommandOutput::ok(
            "image: /var/lib/nova/instances/abc/disk\n\
             backing file: /var/lib/nova/instances/_base/7b2e (actual path: /var/lib/nova/instances/_base/7b2e)",
        ),
    );

    let mut creation = StepChain::new();
    creation.push(prepare_security_groups());
    creation.push(prepare_instance());
    creation.push(create_instance());
    let mut migration = Migration::new(&h.deps, request()).with_chain(creation);
    migration.run(&NoCheckpoints).await.expect("instance created");

    let base = migration
        .capture()
        .derived_parameters
        .image
        .expect("base image prepared");
    h.destination.delete_image(&base.id).await.expect("delete base");

    let mut merge = StepChain::new();
    merge.push(merge_and_copy_to_store());
    let mut migration = migration.with_chain(merge);
    migration.run(&NoCheckpoints).await.expect("merged into store");

    let instance_id = migration.context().instance().expect("instance").id.clone();
    let workdir = format!("/tmp/cloudhop/{instance_id}");
    assert!(h.transport.commands_containing("image-download").is_empty());

    let query = position(&h.transport, "qemu-img info /var/lib/nova/instances/abc/disk");
    let issued = h.transport.issued();
    assert_eq!(issued[query].host, "src-ctl");
    assert!(issued[query].command.contains("src-compute"));

    let copies = streams(&h.transport);
    assert_eq!(copies.len(), 2);
    assert!(copies[1].contains("if=/var/lib/nova/instances/_base/7b2e"));
    assert!(copies[1].contains(&format!("of={workdir}/baseimage")));

    let rebase = position(&h.transport, "qemu-img rebase");
    let remove = position(&h.transport, "rbd rm -p compute");
    let convert = position(&h.transport, &format!("rbd:compute/{instance_id}_disk"));
    assert!(query < rebase && rebase < remove && remove < convert);
}

#[tokio::test]
async fn leftover_port_with_the_same_mac_is_replaced() {
    let h = harness(config("", ""));
    h.destination.add_port("port-old", "net-1", "fa:16:3e:00:00:01");
    h.destination.add_port("port-other", "net-1", "fa:16:3e:00:00:99");

    Migration::new(&h.deps, volume_request(Vec::new()))
        .finish(&NoCheckpoints)
        .await
        .expect("migration");

    let calls = h.destination.calls();
    let delete = calls
        .iter()
        .position(|call| call == "delete_port port-old")
        .expect("stale port deleted");
    let create = calls
        .iter()
        .position(|call| call.starts_with("create_port"))
        .expect("port created");
    assert!(delete < create);

    let ports = h.destination.ports();
    assert!(ports.iter().all(|port| port.id != "port-old"));
    assert!(ports.iter().any(|port| port.id == "port-other"));
    assert_eq!(
        ports
            .iter()
            .filter(|port| port.mac_address == "fa:16:3e:00:00:01")
            .count(),
        1
    );
}

#[tokio::test]
async fn kept_ip_picks_the_network_by_admin_subnet() {
    let h = harness(config("", "keep_ip = true"));
    h.destination.add_network("net-2", "public");
    h.destination
        .add_subnet("sub-2", "net-2", "tenant-ops", "192.168.10.0/24");
    h.destination
        .add_subnet("sub-1", "net-1", "tenant-admin", "192.168.10.0/24");
    let mut request = request();
    request.networks[0].name = Some("retired-net".to_string());

    let instance = Migration::new(&h.deps, request)
        .finish(&NoCheckpoints)
        .await
        .expect("migration");

    let ports = h.destination.ports();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].network_id, "net-1");
    assert_eq!(
        h.destination.calls_starting_with("add_floating_ip"),
        vec![format!("add_floating_ip {} 203.0.113.7 192.168.10.4", instance.id)]
    );
}

#[tokio::test]
async fn network_override_by_name_keeps_the_requested_mac() {
    let h = harness(config(
        "",
        "\n[import_rules.overwrite]\nnetworks = [{ name = \"private\" }]\n",
    ));
    let mut request = volume_request(Vec::new());
    request.networks[0].name = Some("retired-net".to_string());

    Migration::new(&h.deps, request)
        .finish(&NoCheckpoints)
        .await
        .expect("migration");

    let ports = h.destination.ports();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].network_id, "net-1");
    assert_eq!(ports[0].mac_address, "fa:16:3e:00:00:01");
}
