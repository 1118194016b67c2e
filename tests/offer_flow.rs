//! Broadcast offer tests
//!
//! One holder offers a property to several connected users; the first
//! recipient to accept takes custody.

mod common;

use chrono::{Duration, Utc};
use common::Fixture;
use handreceipt::db::models::{NewTransferOffer, OfferStatus, TransferStatus, TransferType};
use handreceipt::services::offer_service::CreateOfferRequest;
use handreceipt::{HandReceiptError, Repository};

/// Holder plus two connected recipients and one item held by the holder
async fn broadcast_setup() -> (Fixture, i64, i64, i64, i64) {
    let fx = Fixture::builder().without_receipts().build().await;
    let alice = fx.user("Alice");
    let bob = fx.user("Bob");
    let carol = fx.user("Carol");
    fx.connect(alice, bob);
    fx.connect(carol, alice);
    let rifle = fx.property("ABC123", Some(alice));
    (fx, alice, bob, carol, rifle.id)
}

fn offer_to(fx: &Fixture, from: i64, property_id: i64, recipients: Vec<i64>) -> i64 {
    fx.services
        .offers
        .create_offer(
            from,
            CreateOfferRequest {
                property_id,
                recipient_ids: recipients,
                include_components: false,
                notes: Some("Turn-in before leave".into()),
                expires_in_days: Some(7),
            },
        )
        .unwrap()
        .id
}

#[tokio::test]
async fn test_first_accept_wins() {
    let (fx, alice, bob, carol, rifle) = broadcast_setup().await;
    let offer_id = offer_to(&fx, alice, rifle, vec![bob, carol, bob]);

    let offer = fx.services.offers.get_offer(offer_id, alice).unwrap();
    assert_eq!(offer.recipients.len(), 2);
    assert!(offer.expires_at.is_some());

    let accepted = fx.services.offers.accept_offer(offer_id, bob).await.unwrap();
    assert_eq!(accepted.offer.status, OfferStatus::Accepted);
    assert_eq!(accepted.offer.accepted_by_user_id, Some(bob));
    assert_eq!(accepted.transfer.status, TransferStatus::Accepted);
    assert_eq!(accepted.transfer.transfer_type, TransferType::Offer);
    assert_eq!(accepted.transfer.from_user_id, alice);
    assert_eq!(accepted.transfer.to_user_id, bob);
    assert_eq!(fx.holder_of(rifle), Some(bob));
    assert_eq!(fx.ledger_events(rifle, "TRANSFER").len(), 1);

    let err = fx.services.offers.accept_offer(offer_id, carol).await.unwrap_err();
    assert!(matches!(err, HandReceiptError::Conflict(_)));
    assert_eq!(fx.holder_of(rifle), Some(bob));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_recipients_single_winner() {
    let (fx, alice, bob, carol, rifle) = broadcast_setup().await;
    let offer_id = offer_to(&fx, alice, rifle, vec![bob, carol]);

    let handles: Vec<_> = [bob, carol]
        .into_iter()
        .map(|user| {
            let offers = fx.services.offers.clone();
            tokio::spawn(async move { offers.accept_offer(offer_id, user).await })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(acceptance) => winners.push(acceptance.transfer.to_user_id),
            Err(HandReceiptError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(fx.holder_of(rifle), Some(winners[0]));
    assert_eq!(fx.ledger_events(rifle, "TRANSFER").len(), 1);
}

#[tokio::test]
async fn test_non_recipient_cannot_accept() {
    let (fx, alice, bob, carol, rifle) = broadcast_setup().await;
    let offer_id = offer_to(&fx, alice, rifle, vec![bob]);

    let err = fx.services.offers.accept_offer(offer_id, carol).await.unwrap_err();
    assert!(matches!(err, HandReceiptError::Unauthorized(_)));
    let err = fx.services.offers.get_offer(offer_id, carol).unwrap_err();
    assert!(matches!(err, HandReceiptError::Unauthorized(_)));
    assert_eq!(fx.holder_of(rifle), Some(alice));
}

#[tokio::test]
async fn test_offer_requires_connected_recipients() {
    let (fx, alice, bob, _carol, rifle) = broadcast_setup().await;
    let stranger = fx.user("Dave");

    let err = fx
        .services
        .offers
        .create_offer(
            alice,
            CreateOfferRequest {
                property_id: rifle,
                recipient_ids: vec![bob, stranger],
                include_components: false,
                notes: None,
                expires_in_days: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, HandReceiptError::Unauthorized(_)));
    assert!(fx.services.offers.list_my_offers(alice).unwrap().is_empty());
}

#[tokio::test]
async fn test_offer_input_validation() {
    let (fx, alice, bob, _carol, rifle) = broadcast_setup().await;

    let request = |recipients: Vec<i64>, days: Option<u32>| CreateOfferRequest {
        property_id: rifle,
        recipient_ids: recipients,
        include_components: false,
        notes: None,
        expires_in_days: days,
    };

    let err = fx.services.offers.create_offer(alice, request(vec![], None)).unwrap_err();
    assert!(matches!(err, HandReceiptError::InvalidInput(_)));
    let err = fx.services.offers.create_offer(alice, request(vec![alice, bob], None)).unwrap_err();
    assert!(matches!(err, HandReceiptError::InvalidInput(_)));
    let err = fx.services.offers.create_offer(alice, request(vec![bob], Some(0))).unwrap_err();
    assert!(matches!(err, HandReceiptError::InvalidInput(_)));

    // Only the holder can offer
    let err = fx.services.offers.create_offer(bob, request(vec![alice], None)).unwrap_err();
    assert!(matches!(err, HandReceiptError::Unauthorized(_)));
}

#[tokio::test]
async fn test_expired_offer_cannot_be_accepted() {
    let (fx, alice, bob, _carol, rifle) = broadcast_setup().await;
    let stale = fx
        .db
        .create_transfer_offer(&NewTransferOffer {
            property_id: rifle,
            offering_user_id: alice,
            recipient_ids: vec![bob],
            include_components: false,
            notes: None,
            expires_at: Some(Utc::now() - Duration::hours(1)),
        })
        .unwrap();

    assert!(fx.services.offers.list_active_offers(bob).unwrap().is_empty());

    let err = fx.services.offers.accept_offer(stale.id, bob).await.unwrap_err();
    assert!(matches!(err, HandReceiptError::Conflict(_)));
    assert_eq!(
        fx.services.offers.get_offer(stale.id, alice).unwrap().status,
        OfferStatus::Expired
    );
    assert_eq!(fx.holder_of(rifle), Some(alice));
}

#[tokio::test]
async fn test_cancelled_offer_is_closed() {
    let (fx, alice, bob, _carol, rifle) = broadcast_setup().await;
    let offer_id = offer_to(&fx, alice, rifle, vec![bob]);

    let err = fx.services.offers.cancel_offer(offer_id, bob).unwrap_err();
    assert!(matches!(err, HandReceiptError::Unauthorized(_)));

    let cancelled = fx.services.offers.cancel_offer(offer_id, alice).unwrap();
    assert_eq!(cancelled.status, OfferStatus::Cancelled);
    assert!(fx.services.offers.list_active_offers(bob).unwrap().is_empty());

    let err = fx.services.offers.accept_offer(offer_id, bob).await.unwrap_err();
    assert!(matches!(err, HandReceiptError::Conflict(_)));
    let err = fx.services.offers.cancel_offer(offer_id, alice).unwrap_err();
    assert!(matches!(err, HandReceiptError::Conflict(_)));
}

#[tokio::test]
async fn test_listing_marks_offer_viewed() {
    let (fx, alice, bob, carol, rifle) = broadcast_setup().await;
    let offer_id = offer_to(&fx, alice, rifle, vec![bob, carol]);

    let listed = fx.services.offers.list_active_offers(bob).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, offer_id);

    let stored = fx.services.offers.get_offer(offer_id, alice).unwrap();
    let viewed = |user: i64| {
        stored
            .recipients
            .iter()
            .find(|r| r.recipient_user_id == user)
            .and_then(|r| r.viewed_at)
    };
    assert!(viewed(bob).is_some());
    assert!(viewed(carol).is_none());
}

#[tokio::test]
async fn test_offer_fails_once_holder_moved_item() {
    let (fx, alice, bob, carol, rifle) = broadcast_setup().await;
    let to_carol = offer_to(&fx, alice, rifle, vec![carol]);
    let to_bob = offer_to(&fx, alice, rifle, vec![bob]);

    fx.services.offers.accept_offer(to_bob, bob).await.unwrap();

    let err = fx.services.offers.accept_offer(to_carol, carol).await.unwrap_err();
    assert!(matches!(err, HandReceiptError::Conflict(_)));
    assert_eq!(
        fx.services.offers.get_offer(to_carol, carol).unwrap().status,
        OfferStatus::Active
    );
}

#[tokio::test]
async fn test_failed_custody_update_reopens_offer() {
    let (fx, alice, bob, _carol, rifle) = broadcast_setup().await;
    let offer_id = offer_to(&fx, alice, rifle, vec![bob]);

    fx.repo.fail_updates_for(rifle);
    let err = fx.services.offers.accept_offer(offer_id, bob).await.unwrap_err();
    assert!(matches!(err, HandReceiptError::Internal(_)));

    let offer = fx.services.offers.get_offer(offer_id, bob).unwrap();
    assert_eq!(offer.status, OfferStatus::Active);
    assert!(offer.accepted_by_user_id.is_none());
    assert_eq!(fx.holder_of(rifle), Some(alice));

    let transfers = fx.services.transfers.list_transfers(bob, Default::default()).unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].status, TransferStatus::Cancelled);

    fx.repo.heal();
    let accepted = fx.services.offers.accept_offer(offer_id, bob).await.unwrap();
    assert_eq!(accepted.property.assigned_to_user_id, Some(bob));
}
