//! The `kernel://` introspection routes: system views, principal CRUD,
//! resource queries, permission management, and profiles.
//!
//! Every handler authenticates the caller's pkr before consulting the
//! registries and answers plain data; the uniform `{success, data}` /
//! `{success: false, error}` envelope is applied by `send_protected`.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};

use nerva_core::{
    handler, DispatchOptions, KernelError, Pkr, RouteKind, RouteMetadata, Subsystem,
};
use nerva_security::{AccessControl, GrantKind, PermissionProfile, PrincipalKind};

use crate::correlator::ResponseCorrelator;
use crate::kernel::KernelStats;

#[derive(Clone)]
pub(crate) struct Deps {
    pub access: Arc<AccessControl>,
    pub subsystems: Arc<DashMap<String, Arc<Subsystem>>>,
    pub correlator: Arc<ResponseCorrelator>,
    pub stats: Arc<KernelStats>,
    pub started_at: i64,
}

fn authenticate(access: &AccessControl, options: &DispatchOptions) -> Result<Pkr, KernelError> {
    let caller = options
        .caller_id
        .ok_or_else(|| KernelError::forbidden("introspection requires a caller pkr"))?;
    if !access.principal_exists(caller) {
        return Err(KernelError::forbidden(format!(
            "caller '{}' is not a registered principal",
            caller
        )));
    }
    Ok(caller)
}

fn body_pkr(body: &Value, key: &str) -> Result<Pkr, KernelError> {
    body.get(key)
        .and_then(Value::as_str)
        .and_then(Pkr::parse)
        .ok_or_else(|| KernelError::validation(format!("body key '{}' must be a pkr", key)))
}

fn body_grant_kind(body: &Value) -> Result<GrantKind, KernelError> {
    serde_json::from_value(body.get("kind").cloned().unwrap_or(Value::Null))
        .map_err(|_| KernelError::validation("body key 'kind' must be reader|writer|granter"))
}

fn subsystem_summary(subsystem: &Subsystem) -> Value {
    json!({
        "name": subsystem.name(),
        "state": subsystem.state(),
        "queue_size": subsystem.queue_size(),
        "priority": subsystem.priority(),
    })
}

fn resource_view(access: &AccessControl, caller: Pkr, name: &str) -> Result<Value, KernelError> {
    let resource = access
        .resource_by_name(name)
        .ok_or_else(|| KernelError::not_found(format!("no resource '{}'", name)))?;
    if !access.can_read(resource.pkr, caller) {
        return Err(KernelError::forbidden(format!(
            "caller may not read resource '{}'",
            name
        )));
    }
    Ok(serde_json::to_value(&resource).unwrap_or(Value::Null))
}

fn resolve_resource(access: &AccessControl, name: &str) -> Result<Pkr, KernelError> {
    access
        .resource_by_name(name)
        .map(|resource| resource.pkr)
        .ok_or_else(|| KernelError::not_found(format!("no resource '{}'", name)))
}

pub(crate) fn register_routes(
    subsystem: &Arc<Subsystem>,
    deps: Deps,
) -> Result<(), KernelError> {
    let query = || RouteMetadata::of_kind(RouteKind::Query);
    let command = || RouteMetadata::of_kind(RouteKind::Command);

    // ── system ──────────────────────────────────────────────────────────

    let d = deps.clone();
    subsystem.register_route(
        "system/subsystems",
        handler(move |_msg, _params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                let mut list: Vec<Value> = d
                    .subsystems
                    .iter()
                    .map(|entry| subsystem_summary(&entry))
                    .collect();
                list.sort_by_key(|v| v["name"].as_str().map(str::to_string));
                Ok(Value::Array(list))
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "system/subsystem/{name}",
        handler(move |_msg, params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                let name = params["name"].clone();
                let target = d
                    .subsystems
                    .get(&name)
                    .map(|entry| Arc::clone(&entry))
                    .ok_or_else(|| {
                        KernelError::not_found(format!("unknown subsystem '{}'", name))
                    })?;
                let routes = target
                    .router()
                    .map(|router| serde_json::to_value(router.routes()).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null);
                Ok(json!({
                    "name": target.name(),
                    "state": target.state(),
                    "queue_size": target.queue_size(),
                    "priority": target.priority(),
                    "facets": target.facet_kinds(),
                    "routes": routes,
                    "statistics": target.stats_snapshot(),
                }))
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "system/status",
        handler(move |_msg, _params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                Ok(json!({
                    "subsystems": d.subsystems.len(),
                    "principals": d.access.principal_count(),
                    "pending_responses": d.correlator.pending_count(),
                    "uptime_ms": chrono::Utc::now().timestamp_millis() - d.started_at,
                }))
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "system/statistics",
        handler(move |_msg, _params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                let mut per_subsystem = serde_json::Map::new();
                for entry in d.subsystems.iter() {
                    per_subsystem.insert(
                        entry.key().clone(),
                        serde_json::to_value(entry.stats_snapshot()).unwrap_or(Value::Null),
                    );
                }
                Ok(json!({
                    "kernel": d.stats.snapshot(),
                    "subsystems": Value::Object(per_subsystem),
                }))
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "system/routes",
        handler(move |_msg, _params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                let mut all = serde_json::Map::new();
                for entry in d.subsystems.iter() {
                    if let Some(router) = entry.router() {
                        all.insert(
                            entry.key().clone(),
                            serde_json::to_value(router.routes()).unwrap_or(Value::Null),
                        );
                    }
                }
                Ok(Value::Object(all))
            }
        }),
        query(),
    )?;

    // ── principals ──────────────────────────────────────────────────────

    let d = deps.clone();
    subsystem.register_route(
        "principals/friends",
        handler(move |_msg, _params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                Ok(serde_json::to_value(d.access.friends()).unwrap_or(Value::Null))
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "principals/friends/query",
        handler(move |msg, _params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                let role = msg.body().get("role").and_then(Value::as_str).map(str::to_string);
                let name = msg.body().get("name").and_then(Value::as_str).map(str::to_string);
                let friends: Vec<_> = d
                    .access
                    .friends()
                    .into_iter()
                    .filter(|f| role.as_deref().map_or(true, |r| f.role() == Some(r)))
                    .filter(|f| name.as_deref().map_or(true, |n| f.name == n))
                    .collect();
                Ok(serde_json::to_value(friends).unwrap_or(Value::Null))
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "principals/friends/update",
        handler(move |msg, _params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                let target = body_pkr(msg.body(), "pkr")?;
                let metadata = msg
                    .body()
                    .get("metadata")
                    .cloned()
                    .ok_or_else(|| KernelError::validation("body key 'metadata' required"))?;
                d.access.update_metadata(caller, target, metadata)?;
                Ok(json!({"updated": target.to_string()}))
            }
        }),
        command(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "principals/friends/delete",
        handler(move |msg, _params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                let target = body_pkr(msg.body(), "pkr")?;
                let principal = d
                    .access
                    .principal(target)
                    .ok_or_else(|| KernelError::not_found(format!("no principal '{}'", target)))?;
                if principal.kind != PrincipalKind::Friend {
                    return Err(KernelError::validation("only friends can be deleted here"));
                }
                if caller != target && !d.access.can_grant(target, caller) {
                    return Err(KernelError::forbidden(
                        "deleting a friend requires grant rights on it",
                    ));
                }
                let removed = d.access.dispose_principal(target);
                d.correlator.cancel_for_owner(target);
                Ok(json!({"removed": removed}))
            }
        }),
        command(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "principals/friend/pkr/{uuid}",
        handler(move |_msg, params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                let pkr = Pkr::parse(&params["uuid"])
                    .ok_or_else(|| KernelError::validation("path segment is not a pkr"))?;
                let principal = d
                    .access
                    .principal(pkr)
                    .filter(|p| p.kind == PrincipalKind::Friend)
                    .ok_or_else(|| KernelError::not_found(format!("no friend '{}'", pkr)))?;
                Ok(serde_json::to_value(&principal).unwrap_or(Value::Null))
            }
        }),
        query(),
    )?;

    // ── resources ───────────────────────────────────────────────────────

    let d = deps.clone();
    subsystem.register_route(
        "resources/by-owner",
        handler(move |msg, _params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                let owner = match msg.body().get("owner") {
                    Some(_) => body_pkr(msg.body(), "owner")?,
                    None => caller,
                };
                Ok(serde_json::to_value(d.access.resources_by_owner(owner))
                    .unwrap_or(Value::Null))
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "resources/by-type/{type}",
        handler(move |_msg, params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                Ok(
                    serde_json::to_value(d.access.resources_by_type(&params["type"]))
                        .unwrap_or(Value::Null),
                )
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "resources/{name}",
        handler(move |_msg, params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                resource_view(&d.access, caller, &params["name"])
            }
        }),
        query(),
    )?;

    // ── permissions ─────────────────────────────────────────────────────

    let d = deps.clone();
    subsystem.register_route(
        "permissions/{resource}",
        handler(move |_msg, params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                let pkr = resolve_resource(&d.access, &params["resource"])?;
                if !d.access.can_read(pkr, caller) {
                    return Err(KernelError::forbidden(
                        "reading permissions requires read rights",
                    ));
                }
                Ok(serde_json::to_value(d.access.rights_snapshot(pkr)).unwrap_or(Value::Null))
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "permissions/{resource}/inherited",
        handler(move |_msg, params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                let pkr = resolve_resource(&d.access, &params["resource"])?;
                if !d.access.can_read(pkr, caller) {
                    return Err(KernelError::forbidden(
                        "reading permissions requires read rights",
                    ));
                }
                Ok(serde_json::to_value(d.access.inherited_rights(pkr)).unwrap_or(Value::Null))
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "permissions/{resource}/grant",
        handler(move |msg, params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                let pkr = resolve_resource(&d.access, &params["resource"])?;
                let kind = body_grant_kind(msg.body())?;
                let grantee = body_pkr(msg.body(), "grantee")?;
                d.access.grant(caller, pkr, kind, grantee)?;
                Ok(json!({"granted": grantee.to_string()}))
            }
        }),
        command(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "permissions/{resource}/revoke",
        handler(move |msg, params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                let pkr = resolve_resource(&d.access, &params["resource"])?;
                let kind = body_grant_kind(msg.body())?;
                let grantee = body_pkr(msg.body(), "grantee")?;
                d.access.revoke(caller, pkr, kind, grantee)?;
                Ok(json!({"revoked": grantee.to_string()}))
            }
        }),
        command(),
    )?;

    // ── profiles ────────────────────────────────────────────────────────

    let d = deps.clone();
    subsystem.register_route(
        "profiles/create",
        handler(move |msg, _params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                let profile: PermissionProfile = serde_json::from_value(msg.body().clone())
                    .map_err(|err| {
                        KernelError::validation(format!("malformed profile: {err}"))
                    })?;
                let name = profile.name.clone();
                d.access.profiles().create(profile)?;
                Ok(json!({"created": name}))
            }
        }),
        command(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "profiles/query",
        handler(move |msg, _params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                match msg.body().get("name").and_then(Value::as_str) {
                    Some(name) => {
                        let profile = d.access.profiles().get(name).ok_or_else(|| {
                            KernelError::not_found(format!("no profile '{}'", name))
                        })?;
                        Ok(serde_json::to_value(profile).unwrap_or(Value::Null))
                    }
                    None => {
                        Ok(serde_json::to_value(d.access.profiles().list())
                            .unwrap_or(Value::Null))
                    }
                }
            }
        }),
        query(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "profiles/apply",
        handler(move |msg, _params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                let profile = msg
                    .body()
                    .get("profile")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KernelError::validation("body key 'profile' required"))?;
                let resource = msg
                    .body()
                    .get("resource")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KernelError::validation("body key 'resource' required"))?;
                let target = resolve_resource(&d.access, resource)?;
                let applied = d.access.apply_profile(caller, profile, target)?;
                Ok(json!({"applied": applied}))
            }
        }),
        command(),
    )?;

    let d = deps.clone();
    subsystem.register_route(
        "profiles/remove",
        handler(move |msg, _params, options| {
            let d = d.clone();
            async move {
                let caller = authenticate(&d.access, &options)?;
                let profile = msg
                    .body()
                    .get("profile")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KernelError::validation("body key 'profile' required"))?;
                let resource = msg
                    .body()
                    .get("resource")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KernelError::validation("body key 'resource' required"))?;
                let target = resolve_resource(&d.access, resource)?;
                let removed = d.access.remove_profile(caller, profile, target)?;
                Ok(json!({"removed": removed}))
            }
        }),
        command(),
    )?;

    let d = deps;
    subsystem.register_route(
        "profiles/delete",
        handler(move |msg, _params, options| {
            let d = d.clone();
            async move {
                authenticate(&d.access, &options)?;
                let name = msg
                    .body()
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KernelError::validation("body key 'name' required"))?;
                if !d.access.profiles().delete(name) {
                    return Err(KernelError::not_found(format!("no profile '{}'", name)));
                }
                Ok(json!({"deleted": name}))
            }
        }),
        command(),
    )?;

    Ok(())
}
