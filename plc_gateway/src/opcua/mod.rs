use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use opcua::server::address_space::Variable;
use opcua::server::diagnostics::NamespaceMetadata;
use opcua::server::node_manager::memory::{simple_node_manager, SimpleNodeManager};
use opcua::server::ServerBuilder;
use opcua::types::{DataValue, DateTime, NodeId, StatusCode, Variant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::poll::{PollerHandle, TagWrite};
use crate::tags::store::TagStore;
use crate::tags::structures::{Datatype, PlcName, Quality, TagRecord, Value};

const NAMESPACE_URI: &str = "urn:plc_gateway:tags";

/// Run the OPC UA server until shutdown. The server is an optional
/// capability: any startup failure is logged and the gateway continues
/// without it.
pub async fn run_opcua_server(
    port: u16,
    store: TagStore,
    writers: Arc<HashMap<PlcName, PollerHandle>>,
    sync_period: Duration,
    cancel: CancellationToken,
) {
    if let Err(e) = serve(port, store, writers, sync_period, cancel).await {
        warn!(error = %e, "OPC UA server unavailable, continuing without it");
    }
}

async fn serve(
    port: u16,
    store: TagStore,
    writers: Arc<HashMap<PlcName, PollerHandle>>,
    sync_period: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (server, handle) = ServerBuilder::new_anonymous("PLC Gateway")
        .host("0.0.0.0")
        .port(port)
        .with_node_manager(simple_node_manager(
            NamespaceMetadata {
                namespace_uri: NAMESPACE_URI.to_string(),
                ..Default::default()
            },
            "gateway",
        ))
        .build()
        .map_err(|e| anyhow::anyhow!("server build failed: {e:?}"))?;

    let node_manager = handle
        .node_managers()
        .get_of_type::<SimpleNodeManager>()
        .context("simple node manager missing")?;
    let ns = handle
        .get_namespace_index(NAMESPACE_URI)
        .context("tag namespace not registered")?;

    // Mirror store snapshots into the node set.
    let mirror = {
        let handle = handle.clone();
        let node_manager = node_manager.clone();
        let store = store.clone();
        let cancel = cancel.clone();
        async move {
            let mut ticker = tokio::time::interval(sync_period);
            let mut published: HashSet<String> = HashSet::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let snapshot = store.snapshot();

                // Tags deleted from the store read back as unknown nodes.
                let live: HashSet<String> = snapshot.iter().map(|r| r.id.clone()).collect();
                for gone in published.difference(&live) {
                    let dv = DataValue {
                        value: Some(Variant::Empty),
                        status: Some(StatusCode::BadNodeIdUnknown),
                        source_timestamp: Some(DateTime::now()),
                        ..Default::default()
                    };
                    if let Err(e) = node_manager.set_value(
                        &handle.subscriptions(),
                        &NodeId::new(ns, gone.clone()),
                        None,
                        dv,
                    ) {
                        debug!(tag = %gone, error = ?e, "node retire failed");
                    }
                }
                published.retain(|id| live.contains(id));

                for record in snapshot {
                    let node_id = NodeId::new(ns, record.id.clone());
                    if published.insert(record.id.clone()) {
                        add_tag_node(&node_manager, &node_id, &record, &store, &writers);
                    }
                    let dv = DataValue {
                        value: Some(value_to_variant(&record)),
                        status: Some(quality_status(&record)),
                        source_timestamp: Some(DateTime::now()),
                        ..Default::default()
                    };
                    if let Err(e) =
                        node_manager.set_value(&handle.subscriptions(), &node_id, None, dv)
                    {
                        debug!(tag = %record.id, error = ?e, "node update failed");
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = mirror => Ok(()),
        result = server.run() => result.map_err(|e| anyhow::anyhow!("server run failed: {e:?}")),
    }
}

/// Create the variable node for a tag and hook client writes into the
/// store's patch path.
fn add_tag_node(
    node_manager: &Arc<SimpleNodeManager>,
    node_id: &NodeId,
    record: &TagRecord,
    store: &TagStore,
    writers: &Arc<HashMap<PlcName, PollerHandle>>,
) {
    {
        let address_space = node_manager.address_space();
        let mut space = address_space.write();
        let _ = space.add_variables(
            vec![Variable::new(
                node_id,
                record.id.as_str(),
                record.id.as_str(),
                value_to_variant(record),
            )],
            &NodeId::objects_folder_id(),
        );
    }

    let store = store.clone();
    let writers = Arc::clone(writers);
    let id = record.id.clone();
    node_manager
        .inner()
        .add_write_callback(node_id.clone(), move |value, _range| {
            write_from_client(&store, &writers, &id, value)
        });
}

/// Apply an OPC UA client write through the same patch path REST uses.
fn write_from_client(
    store: &TagStore,
    writers: &Arc<HashMap<PlcName, PollerHandle>>,
    id: &str,
    value: DataValue,
) -> StatusCode {
    let current = match store.get(id) {
        Ok(r) => r,
        Err(_) => return StatusCode::BadNodeIdUnknown,
    };
    let variant = match value.value {
        Some(v) => v,
        None => return StatusCode::BadTypeMismatch,
    };
    let parsed = match variant_to_value(current.datatype, &variant) {
        Some(v) => v,
        None => {
            warn!(tag = %id, datatype = ?current.datatype, "OPC UA write type mismatch");
            return StatusCode::BadTypeMismatch;
        }
    };
    if !current.writable {
        return StatusCode::BadNotWritable;
    }
    if let Some(writer) = writers.get(&current.plc) {
        let raw = match parsed.to_raw(current.scale) {
            Ok(raw) => raw,
            Err(_) => return StatusCode::BadTypeMismatch,
        };
        if writer
            .enqueue(TagWrite {
                id: id.to_string(),
                address: current.address.clone(),
                value: raw,
            })
            .is_err()
        {
            return StatusCode::BadResourceUnavailable;
        }
    }
    match store.patch(id, Some(parsed), None) {
        Ok(_) => StatusCode::Good,
        Err(GatewayError::TypeMismatch(_)) => StatusCode::BadTypeMismatch,
        Err(GatewayError::NotFound(_)) => StatusCode::BadNodeIdUnknown,
        Err(GatewayError::InvalidArgument(_)) => StatusCode::BadNotWritable,
        Err(_) => StatusCode::BadInternalError,
    }
}

/// Node variant for a stored value. Decimal keeps the REST rule: a String
/// variant bearing the exact textual form.
fn value_to_variant(record: &TagRecord) -> Variant {
    match &record.value {
        Value::Null => Variant::Empty,
        Value::Bool(b) => Variant::Boolean(*b),
        Value::Int(i) => Variant::Int64(*i),
        Value::Real(f) => Variant::Double(*f),
        Value::Decimal(d) => Variant::String(d.to_string().into()),
        Value::Text(s) => Variant::String(s.as_str().into()),
    }
}

fn quality_status(record: &TagRecord) -> StatusCode {
    match record.wire_quality() {
        Quality::Good => StatusCode::Good,
        Quality::Stale | Quality::Bad | Quality::Uninitialized => StatusCode::Bad,
    }
}

/// Map an incoming variant onto the record's datatype; `None` is a type
/// mismatch the client sees as BadTypeMismatch.
fn variant_to_value(datatype: Datatype, variant: &Variant) -> Option<Value> {
    let json = match variant {
        Variant::Boolean(b) => serde_json::json!(b),
        Variant::SByte(i) => serde_json::json!(i),
        Variant::Byte(u) => serde_json::json!(u),
        Variant::Int16(i) => serde_json::json!(i),
        Variant::UInt16(u) => serde_json::json!(u),
        Variant::Int32(i) => serde_json::json!(i),
        Variant::UInt32(u) => serde_json::json!(u),
        Variant::Int64(i) => serde_json::json!(i),
        Variant::UInt64(u) => serde_json::json!(u),
        Variant::Float(f) => serde_json::json!(f),
        Variant::Double(d) => serde_json::json!(d),
        Variant::String(s) => serde_json::json!(s.to_string()),
        _ => return None,
    };
    Value::from_json(datatype, &json).ok()
}
