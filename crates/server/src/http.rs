// Copyright 2024 tison <wander4096@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::sync::Arc;

use laser_codec::RecordKey;
use laser_engine::KvEngine;
use laser_engine::SetOptions;
use laser_protos::config::InitialConfig;
use laser_protos::entity::PartitionMetaInfo;
use laser_protos::entity::ShardMetaInfo;
use laser_protos::rpc::ForceBaseReplicationRequest;
use laser_protos::rpc::KvRequest;
use laser_protos::rpc::KvResponse;
use laser_protos::rpc::ReplicateRequest;
use laser_protos::rpc::ReplicateResponse;
use laser_protos::rpc::ReplicateWdtRequest;
use laser_protos::rpc::ReplicateWdtResponse;
use laser_protos::rpc::ScoreMember;
use laser_protos::rpc::TriggerBaseRequest;
use laser_protos::rpc::TriggerDeltaRequest;
use laser_protos::rpc::UnavailableShardsRequest;
use laser_protos::Status;
use poem::middleware::AddData;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::EndpointExt;
use poem::Route;

use crate::database_manager::DatabaseManager;
use crate::error::ErrorWithCode;

#[poem::handler]
async fn health_check() -> poem::Result<String> {
    Ok("OK".to_string())
}

#[poem::handler]
async fn replicate(
    Data(manager): Data<&Arc<DatabaseManager>>,
    Json(request): Json<ReplicateRequest>,
) -> poem::Result<Json<ReplicateResponse>> {
    let response = manager
        .replicator_manager()
        .handle_replicate(request)
        .await
        .map_err(|code| ErrorWithCode::new(code, "failed to serve replicate"))?;
    Ok(Json(response))
}

#[poem::handler]
async fn replicate_wdt(
    Data(manager): Data<&Arc<DatabaseManager>>,
    Json(request): Json<ReplicateWdtRequest>,
) -> poem::Result<Json<ReplicateWdtResponse>> {
    let response = manager
        .replicator_manager()
        .handle_replicate_wdt(request)
        .await
        .map_err(|code| ErrorWithCode::new(code, "failed to serve snapshot transfer"))?;
    Ok(Json(response))
}

#[poem::handler]
async fn trigger_base(
    Data(manager): Data<&Arc<DatabaseManager>>,
    Json(request): Json<TriggerBaseRequest>,
) -> poem::Result<Json<serde_json::Value>> {
    manager.trigger_base(&request.database, &request.table, &request.version);
    Ok(Json(serde_json::json!({})))
}

#[poem::handler]
async fn trigger_delta(
    Data(manager): Data<&Arc<DatabaseManager>>,
    Json(request): Json<TriggerDeltaRequest>,
) -> poem::Result<Json<serde_json::Value>> {
    manager.trigger_delta(
        &request.database,
        &request.table,
        &request.base_version,
        request.delta_versions,
    );
    Ok(Json(serde_json::json!({})))
}

#[poem::handler]
async fn force_base_replication(
    Data(manager): Data<&Arc<DatabaseManager>>,
    Json(request): Json<ForceBaseReplicationRequest>,
) -> poem::Result<Json<serde_json::Value>> {
    manager.trigger_force_base_replication(&request.database, &request.table);
    Ok(Json(serde_json::json!({})))
}

#[poem::handler]
async fn shard_meta(
    Data(manager): Data<&Arc<DatabaseManager>>,
) -> poem::Result<Json<Vec<ShardMetaInfo>>> {
    Ok(Json(manager.shard_meta_info()))
}

#[poem::handler]
async fn set_unavailable_shards(
    Data(manager): Data<&Arc<DatabaseManager>>,
    Json(request): Json<UnavailableShardsRequest>,
) -> poem::Result<Json<serde_json::Value>> {
    manager.set_unavailable_shards(request.shard_ids);
    Ok(Json(serde_json::json!({})))
}

#[poem::handler]
async fn table_meta(
    Data(manager): Data<&Arc<DatabaseManager>>,
    Path((database, table)): Path<(String, String)>,
) -> poem::Result<Json<Vec<PartitionMetaInfo>>> {
    Ok(Json(manager.table_meta_info(&database, &table)))
}

#[poem::handler]
async fn clean_unused_partitions(
    Data(manager): Data<&Arc<DatabaseManager>>,
) -> poem::Result<Json<Vec<PartitionMetaInfo>>> {
    Ok(Json(manager.clean_unused_partitions()))
}

#[poem::handler]
async fn update_config(
    Data(manager): Data<&Arc<DatabaseManager>>,
    Json(request): Json<InitialConfig>,
) -> poem::Result<Json<serde_json::Value>> {
    manager
        .config_feed()
        .publish(request.shard_list, request.tables);
    Ok(Json(serde_json::json!({})))
}

#[poem::handler]
async fn kv_command(
    Data(manager): Data<&Arc<DatabaseManager>>,
    Path(op): Path<String>,
    Json(request): Json<KvRequest>,
) -> poem::Result<Json<KvResponse>> {
    let key = RecordKey::new(
        request.primary_keys.iter().map(|part| part.as_bytes().to_vec()),
        request.columns.iter().map(|part| part.as_bytes().to_vec()),
    );
    let engine = manager
        .engine_for(&request.database, &request.table, &key)
        .map_err(|code| ErrorWithCode::new(code, "partition not mounted on this node"))?;

    let response = dispatch_kv(&engine, &op, &key, &request)
        .map_err(|code| ErrorWithCode::new(code, format!("{op} failed")))?;
    Ok(Json(response))
}

fn dispatch_kv(
    engine: &KvEngine,
    op: &str,
    key: &RecordKey,
    request: &KvRequest,
) -> Result<KvResponse, Status> {
    let mut response = KvResponse::default();
    match op {
        "get" => {
            let value = engine.get(key)?;
            response.value = Some(String::from_utf8_lossy(&value).into_owned());
        }
        "set" => {
            let value = request.value.as_deref().ok_or(Status::InvalidArgument)?;
            let ttl_ms = request.ttl_ms.unwrap_or(0);
            let not_exists = request.not_exists.unwrap_or(false);
            if ttl_ms > 0 || not_exists {
                engine.setx(key, value.as_bytes(), SetOptions { ttl_ms, not_exists })?;
            } else {
                engine.set(key, value.as_bytes())?;
            }
        }
        "del" => engine.delete(key)?,
        "exist" => response.exists = Some(engine.exist(key)?),
        "ttl" => response.ttl = Some(engine.ttl(key)?),
        "expire" => {
            let delta = request.ttl_ms.ok_or(Status::InvalidArgument)?;
            engine.expire(key, delta)?;
        }
        "incr" => {
            response.counter = Some(engine.incr(key, request.step.unwrap_or(1))?);
        }
        "decr" => {
            response.counter = Some(engine.decr(key, request.step.unwrap_or(1))?);
        }
        "hset" => match (&request.field, &request.value, &request.fields) {
            (Some(field), Some(value), _) => {
                engine.hset(key, field.as_bytes(), value.as_bytes())?
            }
            (_, _, Some(fields)) => {
                let fields = fields
                    .iter()
                    .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
                    .collect();
                engine.hmset(key, &fields)?
            }
            _ => return Err(Status::InvalidArgument),
        },
        "hget" => {
            let field = request.field.as_deref().ok_or(Status::InvalidArgument)?;
            let value = engine.hget(key, field.as_bytes())?;
            response.value = Some(String::from_utf8_lossy(&value).into_owned());
        }
        "hgetall" => {
            let mut fields = BTreeMap::new();
            for (field, value) in engine.hgetall(key)? {
                fields.insert(
                    String::from_utf8_lossy(&field).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                );
            }
            response.length = Some(engine.hlen(key)?.into());
            response.fields = Some(fields);
        }
        "hdel" => {
            let field = request.field.as_deref().ok_or(Status::InvalidArgument)?;
            engine.hdel(key, field.as_bytes())?;
        }
        "lpush" => {
            let value = request.value.as_deref().ok_or(Status::InvalidArgument)?;
            engine.push_front(key, value.as_bytes())?;
        }
        "rpush" => {
            let value = request.value.as_deref().ok_or(Status::InvalidArgument)?;
            engine.push_back(key, value.as_bytes())?;
        }
        "lpop" => {
            let value = engine.pop_front(key)?;
            response.value = Some(String::from_utf8_lossy(&value).into_owned());
        }
        "rpop" => {
            let value = engine.pop_back(key)?;
            response.value = Some(String::from_utf8_lossy(&value).into_owned());
        }
        "lindex" => {
            let index = request.index.ok_or(Status::InvalidArgument)?;
            let value = engine.lindex(key, index)?;
            response.value = Some(String::from_utf8_lossy(&value).into_owned());
        }
        "lrange" => {
            let start = request.start.unwrap_or(0);
            let end = request.end.unwrap_or(0);
            let values = engine
                .lrange(key, start, end)?
                .into_iter()
                .map(|value| String::from_utf8_lossy(&value).into_owned())
                .collect();
            response.values = Some(values);
            response.length = Some(engine.llen(key)? as u64);
        }
        "sadd" => {
            let member = request.member.as_deref().ok_or(Status::InvalidArgument)?;
            engine.sadd(key, member.as_bytes())?;
        }
        "smembers" => {
            let members = engine
                .members(key)?
                .into_iter()
                .map(|member| String::from_utf8_lossy(&member).into_owned())
                .collect();
            response.members = Some(members);
            response.length = Some(engine.scard(key)?.into());
        }
        "sdel" => {
            let member = request.member.as_deref().ok_or(Status::InvalidArgument)?;
            engine.sdel(key, member.as_bytes())?;
        }
        "zadd" => {
            let member_scores = request
                .member_scores
                .as_ref()
                .ok_or(Status::InvalidArgument)?;
            let member_scores = member_scores
                .iter()
                .map(|(member, score)| (member.as_bytes().to_vec(), *score))
                .collect();
            engine.zadd(key, &member_scores)?;
        }
        "zrange_by_score" => {
            let min = request.min.ok_or(Status::InvalidArgument)?;
            let max = request.max.ok_or(Status::InvalidArgument)?;
            let score_members = engine
                .zrange_by_score(key, min, max)?
                .into_iter()
                .map(|(score, member)| ScoreMember {
                    score,
                    member: String::from_utf8_lossy(&member).into_owned(),
                })
                .collect();
            response.score_members = Some(score_members);
        }
        "zrem_range_by_score" => {
            let min = request.min.ok_or(Status::InvalidArgument)?;
            let max = request.max.ok_or(Status::InvalidArgument)?;
            response.removed = Some(engine.zrem_range_by_score(key, min, max)?);
        }
        _ => return Err(Status::NotSupported),
    }
    Ok(response)
}

pub fn make_router(manager: Arc<DatabaseManager>) -> Route {
    let v1_route = Route::new()
        .at("/health", poem::get(health_check))
        .at("/replicate", poem::post(replicate))
        .at("/replicate_wdt", poem::post(replicate_wdt))
        .at("/trigger_base", poem::post(trigger_base))
        .at("/trigger_delta", poem::post(trigger_delta))
        .at(
            "/force_base_replication",
            poem::post(force_base_replication),
        )
        .at("/shards", poem::get(shard_meta))
        .at("/shards/unavailable", poem::post(set_unavailable_shards))
        .at("/tables/:database/:table", poem::get(table_meta))
        .at(
            "/clean_unused_partitions",
            poem::post(clean_unused_partitions),
        )
        .at("/config", poem::post(update_config))
        .at("/kv/:op", poem::post(kv_command))
        .with(AddData::new(manager));

    Route::new().nest("v1", v1_route)
}
