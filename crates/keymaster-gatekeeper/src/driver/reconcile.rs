//! Reconcile a controller's credentials with the Keymaster snapshot.
//!
//! Applying codes never replays a delta blindly: the controller's current
//! credentials are read back and only the difference is sent, so applying
//! the same snapshot twice is a no-op the second time.

use std::collections::{BTreeMap, BTreeSet};

use keymaster_core::DoorCode;

use super::{Credential, CredentialChange, DoorDriver, DriverError};

/// Credentials requested per `list_credentials` call.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Read every credential from `driver`, page by page.
pub async fn load_all_credentials(
    driver: &dyn DoorDriver,
    page_size: usize,
) -> Result<Vec<Credential>, DriverError> {
    let page_size = page_size.max(1);
    let mut all = Vec::new();
    let mut offset = 0;
    loop {
        let page = driver.list_credentials(offset, page_size).await?;
        let returned = page.len();
        all.extend(page);
        if returned < page_size {
            return Ok(all);
        }
        offset += returned;
    }
}

/// Changes that turn `current` into `desired`.
///
/// `desired` is authoritative: credentials absent from it are removed, so an
/// empty list empties the door. Removals come first so that a code moving
/// between users is free before it is re-issued.
pub fn plan_changes(current: &[Credential], desired: &[DoorCode]) -> Vec<CredentialChange> {
    let mut seen_codes = BTreeSet::new();
    let mut wanted: BTreeMap<&str, Vec<&DoorCode>> = BTreeMap::new();
    for code in desired {
        if seen_codes.insert(code.code.as_str()) {
            wanted.entry(code.username.as_str()).or_default().push(code);
        }
    }
    let mut held: BTreeMap<&str, Vec<&Credential>> = BTreeMap::new();
    for credential in current {
        held.entry(credential.username.as_str())
            .or_default()
            .push(credential);
    }

    let users: BTreeSet<&str> = wanted.keys().chain(held.keys()).copied().collect();
    let mut removes = Vec::new();
    let mut changes = Vec::new();
    let mut adds = Vec::new();

    for user in users {
        let want = wanted.get(user).map(Vec::as_slice).unwrap_or_default();
        let have = held.get(user).map(Vec::as_slice).unwrap_or_default();

        let want_codes: BTreeSet<&str> = want.iter().map(|c| c.code.as_str()).collect();
        let have_codes: BTreeSet<&str> = have.iter().map(|c| c.code.as_str()).collect();

        let mut stale: Vec<&Credential> = have
            .iter()
            .copied()
            .filter(|c| !want_codes.contains(c.code.as_str()))
            .collect();
        stale.sort();
        let mut fresh: Vec<&DoorCode> = want
            .iter()
            .copied()
            .filter(|c| !have_codes.contains(c.code.as_str()))
            .collect();
        fresh.sort_by(|a, b| a.code.cmp(&b.code));

        let paired = stale.len().min(fresh.len());
        for (old, new) in stale.iter().zip(fresh.iter()) {
            changes.push(CredentialChange::Change {
                holder_id: old.holder_id.clone(),
                username: user.to_string(),
                old_code: old.code.clone(),
                new_code: new.code.clone(),
            });
        }
        removes.extend(stale[paired..].iter().map(|c| CredentialChange::Remove {
            credential: (*c).clone(),
        }));
        adds.extend(fresh[paired..].iter().map(|c| CredentialChange::Add {
            code: (*c).clone(),
        }));
    }

    removes.into_iter().chain(changes).chain(adds).collect()
}
