use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use n0_snafu::{Result, ResultExt};
use plexus::{
    Config, Identity, InvitationState, Invitations, MapDocument, SharedSecret, Space,
    SpaceManager, SpaceState,
    feed::MemFeedStore,
    invitation::MemTransport,
    space::MemMetadataStore,
    test_utils::MemNetwork,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::time;
use tracing_test::traced_test;

struct Node {
    identity: Identity,
    manager: SpaceManager,
    invitations: Invitations,
    feeds: MemFeedStore,
    metadata: MemMetadataStore,
}

fn node(network: &MemNetwork, transport: &MemTransport, rng: &mut ChaCha8Rng) -> Node {
    let identity = Identity::generate(rng);
    let feeds = MemFeedStore::new();
    let metadata = MemMetadataStore::new();
    let manager = SpaceManager::builder(
        identity.clone(),
        network.dispatcher(identity.device_key()),
    )
    .feeds(Arc::new(feeds.clone()))
    .metadata(Arc::new(metadata.clone()))
    .config(Config::default())
    .build();
    network.join(&manager);
    let invitations = Invitations::spawn(
        manager.clone(),
        Arc::new(transport.clone()),
        transport.bind(identity.device_key()),
    );
    Node {
        identity,
        manager,
        invitations,
        feeds,
        metadata,
    }
}

/// Invite `guest` into `space` of `host`. The invitation makes them replication peers.
async fn join(host: &Node, guest: &Node, space: &Space) -> Result<Space> {
    let secret = SharedSecret::generate(&mut rand::rngs::OsRng);
    let handle = host.invitations.create_invitation(space, secret.clone())?;
    let joined = guest
        .invitations
        .accept_invitation(handle.ticket(), secret)
        .await?;
    assert_eq!(handle.wait().await, InvitationState::Success);
    Ok(joined)
}

async fn converged(a: &Space, b: &Space, doc_id: &str, keys: &[&str]) -> Result<()> {
    time::timeout(Duration::from_secs(10), async {
        loop {
            a.replication().flush_now().await?;
            b.replication().flush_now().await?;
            let left = a.doc(doc_id).await?.read(MapDocument::to_map);
            let right = b.doc(doc_id).await?.read(MapDocument::to_map);
            if left == right && keys.iter().all(|key| left.contains_key(*key)) {
                return Ok::<_, n0_snafu::Error>(());
            }
            time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .e()??;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn invited_guest_replicates_documents() -> Result {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let network = MemNetwork::default();
    let transport = MemTransport::new();
    let host = node(&network, &transport, &mut rng);
    let guest = node(&network, &transport, &mut rng);

    let space = host.manager.create_space().await?;
    space
        .doc("notes")
        .await?
        .change(|doc| doc.set("title", "written before the invitation"));

    let joined = join(&host, &guest, &space).await?;
    assert_eq!(joined.state(), SpaceState::Ready);
    converged(&space, &joined, "notes", &["title"]).await?;
    assert_eq!(
        joined.doc("notes").await?.read(|doc| doc.get("title").cloned()),
        Some(Bytes::from("written before the invitation"))
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn concurrent_edits_converge_without_loss() -> Result {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let network = MemNetwork::default();
    let transport = MemTransport::new();
    let host = node(&network, &transport, &mut rng);
    let guest = node(&network, &transport, &mut rng);
    let space = host.manager.create_space().await?;
    let joined = join(&host, &guest, &space).await?;

    let left = space.doc("board").await?;
    let right = joined.doc("board").await?;
    for i in 0..20 {
        left.change(|doc| doc.set(format!("host-{i}"), format!("{i}")));
        right.change(|doc| doc.set(format!("guest-{i}"), format!("{i}")));
    }
    left.change(|doc| doc.set("shared", "host"));
    right.change(|doc| doc.set("shared", "guest"));

    let keys: Vec<String> = (0..20)
        .flat_map(|i| [format!("host-{i}"), format!("guest-{i}")])
        .collect();
    let keys: Vec<&str> = keys.iter().map(String::as_str).chain(["shared"]).collect();
    converged(&space, &joined, "board", &keys).await?;
    assert_eq!(left.read(MapDocument::len), 41);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn joined_space_reopens_after_restart() -> Result {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let network = MemNetwork::default();
    let transport = MemTransport::new();
    let host = node(&network, &transport, &mut rng);
    let guest = node(&network, &transport, &mut rng);
    let space = host.manager.create_space().await?;
    let joined = join(&host, &guest, &space).await?;
    let meta = *joined.metadata();
    guest.manager.close_space(meta.space_key).await?;
    drop(joined);

    let restarted: SpaceManager = SpaceManager::builder(
        guest.identity.clone(),
        network.dispatcher(guest.identity.device_key()),
    )
    .feeds(Arc::new(guest.feeds.clone()))
    .metadata(Arc::new(guest.metadata.clone()))
    .build();
    let spaces = restarted.open_all().await?;
    assert_eq!(spaces.len(), 1);
    let reopened = &spaces[0];
    assert_eq!(*reopened.metadata(), meta);
    assert_eq!(reopened.state(), SpaceState::Ready);
    assert!(reopened.is_authorized(&host.identity.identity_key()));
    assert!(reopened.is_authorized(&guest.identity.identity_key()));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn edits_after_joining_reach_the_other_side() -> Result {
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let network = MemNetwork::default();
    let transport = MemTransport::new();
    let host = node(&network, &transport, &mut rng);
    let guest = node(&network, &transport, &mut rng);
    let space = host.manager.create_space().await?;
    let joined = join(&host, &guest, &space).await?;

    joined
        .doc("todo")
        .await?
        .change(|doc| doc.set("milk", "2l"));
    converged(&space, &joined, "todo", &["milk"]).await?;
    assert_eq!(
        space.doc("todo").await?.read(|doc| doc.get("milk").cloned()),
        Some(Bytes::from("2l"))
    );
    Ok(())
}
