//! CNAME/DNAME chasing.
//!
//! Each hop asks for the caller's types plus the two alias kinds. A hop
//! that yields any terminal record ends the chase; otherwise the alias
//! target becomes the next name. The hop count is bounded.

use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::debug;

use nimbus_dns_domain::hostname::normalize_name;
use nimbus_dns_domain::{RecordType, ResolveError, UpstreamEndpoint, MAX_CHASE_DEPTH};

use crate::cache::CacheKey;
use crate::multiplex::{AnswerGroups, Multiplexer};

pub(crate) async fn chase(
    mux: &Arc<Multiplexer>,
    endpoint: UpstreamEndpoint,
    name: &str,
    types: &[RecordType],
    use_cache: bool,
    deadline: Instant,
) -> Result<AnswerGroups, ResolveError> {
    if let Some(alias) = types.iter().find(|t| t.is_alias()) {
        return Err(ResolveError::AliasQuery(*alias));
    }
    if types.is_empty() {
        return Err(ResolveError::NoRecord);
    }

    let mut augmented: Vec<RecordType> = types.to_vec();
    for alias in [RecordType::CNAME, RecordType::DNAME] {
        if !augmented.contains(&alias) {
            augmented.push(alias);
        }
    }

    let mut name = name.to_string();
    for _ in 0..MAX_CHASE_DEPTH {
        let mut groups = AnswerGroups::new();
        let mut errors: Vec<ResolveError> = Vec::new();

        let mut to_query = Vec::new();
        for record_type in &augmented {
            if use_cache {
                if let Some(records) = mux
                    .cache()
                    .get(&CacheKey::new(name.clone(), *record_type))
                {
                    for record in records {
                        groups.push(record);
                    }
                    continue;
                }
            }
            to_query.push(*record_type);
        }

        let results = join_all(
            to_query
                .iter()
                .map(|record_type| mux.exchange(endpoint, &name, *record_type, deadline)),
        )
        .await;
        for result in results {
            match result {
                Ok(answer) => groups.merge(answer),
                Err(e) => errors.push(e),
            }
        }

        if types.iter().any(|t| groups.contains(*t)) {
            groups.remove(RecordType::CNAME);
            groups.remove(RecordType::DNAME);
            return Ok(groups);
        }

        // DNAME outranks CNAME when both are present.
        let target = groups
            .first_data(RecordType::DNAME)
            .or_else(|| groups.first_data(RecordType::CNAME))
            .map(normalize_name);
        match target {
            Some(target) => {
                debug!(from = %name, to = %target, "following alias");
                name = target;
            }
            None => return Err(pick_error(errors)),
        }
    }

    Err(ResolveError::ChainTooLong(MAX_CHASE_DEPTH))
}

/// The most informative of a hop's failures: anything beats "no record",
/// which is the expected outcome for most of the augmented types.
pub(crate) fn pick_error(mut errors: Vec<ResolveError>) -> ResolveError {
    match errors
        .iter()
        .position(|e| !matches!(e, ResolveError::NoRecord))
    {
        Some(idx) => errors.swap_remove(idx),
        None => errors.into_iter().next().unwrap_or(ResolveError::NoRecord),
    }
}
