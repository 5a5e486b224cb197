/// Have-diff reconciliation.
///
/// Both inputs are `(id, modno)` pairs sorted by id, where the id is the
/// owner's id for the operation. Anything that differs is requested: the
/// owner answers with the current version, or reports the id as deleted.

/// Ids to request from the owner.
pub(crate) fn ids_to_request(local: &[(i64, i64)], remote: &[(i64, i64)]) -> Vec<i64> {
    let mut request = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < local.len() && j < remote.len() {
        let (local_id, local_modno) = local[i];
        let (remote_id, remote_modno) = remote[j];
        if local_id == remote_id {
            if local_modno != remote_modno {
                request.push(remote_id);
            }
            i += 1;
            j += 1;
        } else if local_id < remote_id {
            // we hold a copy the owner no longer lists
            request.push(local_id);
            i += 1;
        } else {
            request.push(remote_id);
            j += 1;
        }
    }
    request.extend(local[i..].iter().map(|(id, _)| *id));
    request.extend(remote[j..].iter().map(|(id, _)| *id));
    request
}

/// Zip parallel id and modno lists into sorted pairs. `None` if the lengths differ.
pub(crate) fn sorted_pairs(ids: &[i64], modnos: &[i64]) -> Option<Vec<(i64, i64)>> {
    if ids.len() != modnos.len() {
        return None;
    }
    let mut pairs: Vec<(i64, i64)> = ids.iter().copied().zip(modnos.iter().copied()).collect();
    pairs.sort_unstable();
    Some(pairs)
}
