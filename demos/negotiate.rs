// A seller offers terms, amends them, and the buyer accepts. Every party keeps
// its own view of the ledger inside one sled database.
//
//     RUST_LOG=sale_agreement=debug cargo run --example negotiate
use std::sync::Arc;

use anyhow::Context;
use sale_agreement::{
    agreement::DataHash,
    config::NegotiationConfig,
    identity::{Directory, Party},
    node::Node,
    notary::Notary,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("sale_agreement=info");

    let dir = tempfile::tempdir()?;
    let db = sled::open(dir.path().join("negotiate.db"))?;
    let config = NegotiationConfig::from_env()?;

    let notary = Arc::new(Notary::open(Party::generate("notary")?, &db)?);
    let directory = Arc::new(Directory::new());
    let seller = Node::open(
        Party::generate("seller")?,
        &db,
        notary.clone(),
        directory.clone(),
        config,
    )?;
    let buyer = Node::open(Party::generate("buyer")?, &db, notary, directory, config)?;
    seller.connect(&buyer);

    let offer = seller
        .orchestrator()
        .create("buyer", DataHash::of(b"100 crates of apples at 12 EUR"))
        .await
        .context("offer")?;
    let id = offer.record.id().clone();
    println!("offered   {id} @ {}", offer.record.version_ref());

    let amended = seller
        .orchestrator()
        .update(&id, DataHash::of(b"100 crates of apples at 11 EUR"))
        .await
        .context("amend")?;
    println!("amended   {id} @ {}", amended.record.version_ref());

    let accepted = buyer.orchestrator().accept(&id).await.context("accept")?;
    println!("accepted  {id} @ {}", accepted.record.version_ref());

    // a decided contract cannot be decided again
    match buyer.orchestrator().reject(&id).await {
        Ok(_) => anyhow::bail!("rejecting an accepted contract went through"),
        Err(e) => println!("reject    refused: {e} ({:?})", e.status_hint()),
    }

    for entry in seller.store().history(&id)? {
        println!(
            "  #{} {} {}",
            entry.certificate.height,
            entry.record.status(),
            entry.record.data_hash()
        );
    }

    Ok(())
}
