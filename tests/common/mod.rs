//! Marketplace domain shared by the integration tests: classified ads with
//! nested pictures, user profiles, their read models, and an upcaster.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use marketplace_es::{
    Aggregate, AggregateRoot, AggregateStore, CommandService, DocumentStore, DomainEvent, Entity,
    EventStreamBackend, EventTypeRegistry, InMemoryDocumentStore, InvalidEntityState, Projection,
    ProjectionError, RecordedEvent, UpcastEvent, Upcaster, apply_to_entity, load_document,
    save_document, update_document,
};
use serde::{Deserialize, Serialize};

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// --- Classified ads ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdState {
    #[default]
    Inactive,
    PendingReview,
    Active,
    MarkedAsSold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount: u64,
    pub currency: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Picture {
    pub id: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub order: u32,
}

impl Picture {
    /// Event resizing this picture. The owner applies it.
    pub fn resize(&self, ad_id: &str, width: u32, height: u32) -> AdEvent {
        AdEvent::ClassifiedAdPictureResized {
            picture_id: self.id.clone(),
            classified_ad_id: ad_id.to_string(),
            width,
            height,
        }
    }
}

impl Entity for Picture {
    type Event = AdEvent;

    fn apply(mut self, event: &AdEvent) -> Self {
        match event {
            AdEvent::PictureAddedToAClassifiedAd {
                picture_id,
                url,
                width,
                height,
                order,
                ..
            } => {
                self.id = picture_id.clone();
                self.url = url.clone();
                self.width = *width;
                self.height = *height;
                self.order = *order;
            }
            AdEvent::ClassifiedAdPictureResized { width, height, .. } => {
                self.width = *width;
                self.height = *height;
            }
            _ => {}
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AdEvent {
    ClassifiedAdCreated {
        id: String,
        owner_id: String,
    },
    ClassifiedAdTitleChanged {
        id: String,
        title: String,
    },
    ClassifiedAdTextUpdated {
        id: String,
        ad_text: String,
    },
    ClassifiedAdPriceUpdated {
        id: String,
        price: u64,
        currency_code: String,
    },
    ClassifiedAdSentForReview {
        id: String,
    },
    ClassifiedAdPublished {
        id: String,
        owner_id: String,
        approved_by: String,
    },
    ClassifiedAdDeleted {
        id: String,
    },
    PictureAddedToAClassifiedAd {
        picture_id: String,
        classified_ad_id: String,
        url: String,
        width: u32,
        height: u32,
        order: u32,
    },
    ClassifiedAdPictureResized {
        picture_id: String,
        classified_ad_id: String,
        width: u32,
        height: u32,
    },
}

impl DomainEvent for AdEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "ClassifiedAdCreated",
        "ClassifiedAdTitleChanged",
        "ClassifiedAdTextUpdated",
        "ClassifiedAdPriceUpdated",
        "ClassifiedAdSentForReview",
        "ClassifiedAdPublished",
        "ClassifiedAdDeleted",
        "PictureAddedToAClassifiedAd",
        "ClassifiedAdPictureResized",
    ];
}

#[derive(Debug, thiserror::Error)]
pub enum AdError {
    #[error(transparent)]
    Invalid(#[from] InvalidEntityState),
    #[error("title must be at most 100 characters")]
    TitleTooLong,
    #[error("price must be positive")]
    InvalidPrice,
    #[error("cannot resize a picture that I don't have: {0}")]
    UnknownPicture(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedAd {
    pub owner_id: Option<String>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub price: Option<Price>,
    pub state: AdState,
    pub approved_by: Option<String>,
    pub pictures: Vec<Picture>,
}

impl ClassifiedAd {
    pub fn picture(&self, id: &str) -> Option<&Picture> {
        self.pictures.iter().find(|p| p.id == id)
    }
}

impl Aggregate for ClassifiedAd {
    const AGGREGATE_TYPE: &'static str = "classified_ad";
    type Event = AdEvent;
    type Error = AdError;

    fn apply(mut self, event: &AdEvent) -> Self {
        match event {
            AdEvent::ClassifiedAdCreated { owner_id, .. } => {
                self.owner_id = Some(owner_id.clone());
                self.state = AdState::Inactive;
            }
            AdEvent::ClassifiedAdTitleChanged { title, .. } => self.title = Some(title.clone()),
            AdEvent::ClassifiedAdTextUpdated { ad_text, .. } => self.text = Some(ad_text.clone()),
            AdEvent::ClassifiedAdPriceUpdated {
                price,
                currency_code,
                ..
            } => {
                self.price = Some(Price {
                    amount: *price,
                    currency: currency_code.clone(),
                });
            }
            AdEvent::ClassifiedAdSentForReview { .. } => self.state = AdState::PendingReview,
            AdEvent::ClassifiedAdPublished { approved_by, .. } => {
                self.approved_by = Some(approved_by.clone());
                self.state = AdState::Active;
            }
            AdEvent::ClassifiedAdDeleted { .. } => self.state = AdState::MarkedAsSold,
            AdEvent::PictureAddedToAClassifiedAd { .. } => {
                let mut picture = Picture::default();
                apply_to_entity(&mut picture, event);
                self.pictures.push(picture);
            }
            AdEvent::ClassifiedAdPictureResized { picture_id, .. } => {
                if let Some(picture) = self.pictures.iter_mut().find(|p| &p.id == picture_id) {
                    apply_to_entity(picture, event);
                }
            }
        }
        self
    }

    fn ensure_valid_state(&self, id: &str) -> Result<(), InvalidEntityState> {
        let fail = |reason: &str| -> Result<(), InvalidEntityState> {
            Err(InvalidEntityState::new(
                Self::AGGREGATE_TYPE,
                id,
                self.state,
                reason,
            ))
        };
        if id.is_empty() || self.owner_id.is_none() {
            return fail("ad must have an id and an owner");
        }
        let priced = self.price.as_ref().is_some_and(|p| p.amount > 0);
        match self.state {
            AdState::PendingReview | AdState::Active
                if self.title.is_none() || self.text.is_none() || !priced =>
            {
                fail("ad needs a title, text and a positive price")
            }
            AdState::Active if self.approved_by.is_none() => fail("ad must be approved"),
            _ => Ok(()),
        }
    }
}

pub mod ads {
    use super::*;

    pub fn create(id: &str, owner_id: &str) -> Result<AggregateRoot<ClassifiedAd>, AdError> {
        Ok(AggregateRoot::create(
            id,
            AdEvent::ClassifiedAdCreated {
                id: id.to_string(),
                owner_id: owner_id.to_string(),
            },
        )?)
    }

    pub fn set_title(ad: &mut AggregateRoot<ClassifiedAd>, title: &str) -> Result<(), AdError> {
        if title.chars().count() > 100 {
            return Err(AdError::TitleTooLong);
        }
        let id = ad.id().to_string();
        Ok(ad.apply(AdEvent::ClassifiedAdTitleChanged {
            id,
            title: title.to_string(),
        })?)
    }

    pub fn update_text(ad: &mut AggregateRoot<ClassifiedAd>, text: &str) -> Result<(), AdError> {
        let id = ad.id().to_string();
        Ok(ad.apply(AdEvent::ClassifiedAdTextUpdated {
            id,
            ad_text: text.to_string(),
        })?)
    }

    pub fn update_price(
        ad: &mut AggregateRoot<ClassifiedAd>,
        amount: u64,
        currency: &str,
    ) -> Result<(), AdError> {
        if amount == 0 {
            return Err(AdError::InvalidPrice);
        }
        let id = ad.id().to_string();
        Ok(ad.apply(AdEvent::ClassifiedAdPriceUpdated {
            id,
            price: amount,
            currency_code: currency.to_string(),
        })?)
    }

    pub fn request_to_publish(ad: &mut AggregateRoot<ClassifiedAd>) -> Result<(), AdError> {
        let id = ad.id().to_string();
        Ok(ad.apply(AdEvent::ClassifiedAdSentForReview { id })?)
    }

    pub fn publish(ad: &mut AggregateRoot<ClassifiedAd>, approved_by: &str) -> Result<(), AdError> {
        let id = ad.id().to_string();
        let owner_id = ad.state().owner_id.clone().unwrap_or_default();
        Ok(ad.apply(AdEvent::ClassifiedAdPublished {
            id,
            owner_id,
            approved_by: approved_by.to_string(),
        })?)
    }

    pub fn add_picture(
        ad: &mut AggregateRoot<ClassifiedAd>,
        picture_id: &str,
        url: &str,
        width: u32,
        height: u32,
    ) -> Result<(), AdError> {
        let order = ad
            .state()
            .pictures
            .iter()
            .map(|p| p.order + 1)
            .max()
            .unwrap_or(0);
        let id = ad.id().to_string();
        Ok(ad.apply(AdEvent::PictureAddedToAClassifiedAd {
            picture_id: picture_id.to_string(),
            classified_ad_id: id,
            url: url.to_string(),
            width,
            height,
            order,
        })?)
    }

    pub fn resize_picture(
        ad: &mut AggregateRoot<ClassifiedAd>,
        picture_id: &str,
        width: u32,
        height: u32,
    ) -> Result<(), AdError> {
        let event = ad
            .state()
            .picture(picture_id)
            .ok_or_else(|| AdError::UnknownPicture(picture_id.to_string()))?
            .resize(ad.id(), width, height);
        Ok(ad.apply(event)?)
    }
}

// --- Ad commands ---

pub struct CreateAd {
    pub id: String,
    pub owner_id: String,
}
pub struct SetTitle {
    pub id: String,
    pub title: String,
}
pub struct UpdateText {
    pub id: String,
    pub text: String,
}
pub struct UpdatePrice {
    pub id: String,
    pub amount: u64,
    pub currency: String,
}
pub struct RequestToPublish {
    pub id: String,
}
pub struct Publish {
    pub id: String,
    pub approved_by: String,
}
pub struct AddPicture {
    pub id: String,
    pub picture_id: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
}
pub struct ResizePicture {
    pub id: String,
    pub picture_id: String,
    pub width: u32,
    pub height: u32,
}

pub fn ad_service(store: AggregateStore) -> CommandService<ClassifiedAd> {
    CommandService::new(store)
        .create_when(|c: &CreateAd| c.id.clone(), |id, c: &CreateAd| ads::create(id, &c.owner_id))
        .update_when(|c: &SetTitle| c.id.clone(), |ad, c: &SetTitle| ads::set_title(ad, &c.title))
        .update_when(|c: &UpdateText| c.id.clone(), |ad, c: &UpdateText| ads::update_text(ad, &c.text))
        .update_when(
            |c: &UpdatePrice| c.id.clone(),
            |ad, c: &UpdatePrice| ads::update_price(ad, c.amount, &c.currency),
        )
        .update_when(
            |c: &RequestToPublish| c.id.clone(),
            |ad, _: &RequestToPublish| ads::request_to_publish(ad),
        )
        .update_when(
            |c: &Publish| c.id.clone(),
            |ad, c: &Publish| ads::publish(ad, &c.approved_by),
        )
        .update_when(
            |c: &AddPicture| c.id.clone(),
            |ad, c: &AddPicture| ads::add_picture(ad, &c.picture_id, &c.url, c.width, c.height),
        )
        .update_when(
            |c: &ResizePicture| c.id.clone(),
            |ad, c: &ResizePicture| ads::resize_picture(ad, &c.picture_id, c.width, c.height),
        )
}

// --- User profiles ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProfileEvent {
    UserRegistered {
        user_id: String,
        full_name: String,
        display_name: String,
    },
    UserFullNameUpdated {
        user_id: String,
        full_name: String,
    },
    UserDisplayNameUpdated {
        user_id: String,
        display_name: String,
    },
    ProfilePhotoUploaded {
        user_id: String,
        photo_url: String,
    },
}

impl DomainEvent for ProfileEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "UserRegistered",
        "UserFullNameUpdated",
        "UserDisplayNameUpdated",
        "ProfilePhotoUploaded",
    ];
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error(transparent)]
    Invalid(#[from] InvalidEntityState),
    #[error("display name contains profanity")]
    Profanity,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub full_name: String,
    pub display_name: String,
    pub photo_url: Option<String>,
}

impl Aggregate for UserProfile {
    const AGGREGATE_TYPE: &'static str = "user_profile";
    type Event = ProfileEvent;
    type Error = ProfileError;

    fn apply(mut self, event: &ProfileEvent) -> Self {
        match event {
            ProfileEvent::UserRegistered {
                full_name,
                display_name,
                ..
            } => {
                self.full_name = full_name.clone();
                self.display_name = display_name.clone();
            }
            ProfileEvent::UserFullNameUpdated { full_name, .. } => {
                self.full_name = full_name.clone();
            }
            ProfileEvent::UserDisplayNameUpdated { display_name, .. } => {
                self.display_name = display_name.clone();
            }
            ProfileEvent::ProfilePhotoUploaded { photo_url, .. } => {
                self.photo_url = Some(photo_url.clone());
            }
        }
        self
    }

    fn ensure_valid_state(&self, id: &str) -> Result<(), InvalidEntityState> {
        if id.is_empty() || self.full_name.is_empty() || self.display_name.is_empty() {
            return Err(InvalidEntityState::new(
                Self::AGGREGATE_TYPE,
                id,
                "Registered",
                "profile needs a full name and a display name",
            ));
        }
        Ok(())
    }
}

pub struct RegisterUser {
    pub user_id: String,
    pub full_name: String,
    pub display_name: String,
}
pub struct UpdateUserDisplayName {
    pub user_id: String,
    pub display_name: String,
}
pub struct UpdateUserProfilePhoto {
    pub user_id: String,
    pub photo_url: String,
}

/// Rejects display names containing any word from `blocked`.
pub fn user_service(store: AggregateStore, blocked: &'static [&'static str]) -> CommandService<UserProfile> {
    let check = move |name: &str| -> Result<(), ProfileError> {
        let lower = name.to_lowercase();
        if blocked.iter().any(|w| lower.contains(w)) {
            Err(ProfileError::Profanity)
        } else {
            Ok(())
        }
    };
    CommandService::new(store)
        .create_when(
            |c: &RegisterUser| c.user_id.clone(),
            move |id, c: &RegisterUser| {
                check(&c.display_name)?;
                Ok(AggregateRoot::create(
                    id,
                    ProfileEvent::UserRegistered {
                        user_id: id.to_string(),
                        full_name: c.full_name.clone(),
                        display_name: c.display_name.clone(),
                    },
                )?)
            },
        )
        .update_when(
            |c: &UpdateUserDisplayName| c.user_id.clone(),
            move |user, c: &UpdateUserDisplayName| {
                check(&c.display_name)?;
                Ok(user.apply(ProfileEvent::UserDisplayNameUpdated {
                    user_id: c.user_id.clone(),
                    display_name: c.display_name.clone(),
                })?)
            },
        )
        .update_when(
            |c: &UpdateUserProfilePhoto| c.user_id.clone(),
            |user, c: &UpdateUserProfilePhoto| {
                Ok(user.apply(ProfileEvent::ProfilePhotoUploaded {
                    user_id: c.user_id.clone(),
                    photo_url: c.photo_url.clone(),
                })?)
            },
        )
}

// --- Registry ---

pub const UPCASTED_STREAM: &str = "upcasted-classified-ads";

pub fn registry() -> Arc<EventTypeRegistry> {
    Arc::new(
        EventTypeRegistry::builder()
            .aggregate::<ClassifiedAd>()
            .aggregate::<UserProfile>()
            .event_type("ClassifiedAdPublishedV2", "upcasted_classified_ad")
            .build()
            .expect("marketplace event types are unique"),
    )
}

// --- Read models ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdDetails {
    pub id: String,
    pub seller_id: String,
    pub seller_display_name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<u64>,
    pub currency: Option<String>,
    pub photo_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDetails {
    pub id: String,
    pub display_name: String,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MyAds {
    pub id: String,
    pub ads: Vec<String>,
}

pub fn ad_key(id: &str) -> String {
    format!("classified_ad_details/{id}")
}

pub fn user_key(id: &str) -> String {
    format!("user_details/{id}")
}

pub fn my_ads_key(owner: &str) -> String {
    format!("my_classified_ads/{owner}")
}

fn decode<E: DomainEvent>(event: &RecordedEvent) -> Result<E, ProjectionError> {
    event.decode().map_err(|source| ProjectionError::Decode {
        event_type: event.event_type.clone(),
        position: event.global_position,
        source,
    })
}

pub struct ClassifiedAdDetailsProjection {
    documents: InMemoryDocumentStore,
}

impl ClassifiedAdDetailsProjection {
    pub fn new(documents: InMemoryDocumentStore) -> Self {
        Self { documents }
    }
}

#[async_trait::async_trait]
impl Projection for ClassifiedAdDetailsProjection {
    fn name(&self) -> &str {
        "classified_ad_details"
    }

    fn handles(&self, event_type: &str) -> bool {
        AdEvent::EVENT_TYPES.contains(&event_type) || event_type == "UserDisplayNameUpdated"
    }

    async fn project(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let store: &dyn DocumentStore = &self.documents;

        if event.event_type == "UserDisplayNameUpdated" {
            let ProfileEvent::UserDisplayNameUpdated {
                user_id,
                display_name,
            } = decode::<ProfileEvent>(event)?
            else {
                return Ok(());
            };
            for key in self.documents.keys_with_prefix("classified_ad_details/").await {
                update_document::<AdDetails, _>(store, &key, |d| {
                    if d.seller_id == user_id {
                        d.seller_display_name = Some(display_name.clone());
                    }
                })
                .await?;
            }
            return Ok(());
        }

        match decode::<AdEvent>(event)? {
            AdEvent::ClassifiedAdCreated { id, owner_id } => {
                if load_document::<AdDetails>(store, &ad_key(&id)).await?.is_some() {
                    return Ok(());
                }
                let seller = load_document::<UserDetails>(store, &user_key(&owner_id)).await?;
                let details = AdDetails {
                    id: id.clone(),
                    seller_id: owner_id,
                    seller_display_name: seller.map(|s| s.display_name),
                    ..AdDetails::default()
                };
                save_document(store, &ad_key(&id), &details).await?;
            }
            AdEvent::ClassifiedAdTitleChanged { id, title } => {
                update_document::<AdDetails, _>(store, &ad_key(&id), |d| d.title = Some(title))
                    .await?;
            }
            AdEvent::ClassifiedAdTextUpdated { id, ad_text } => {
                update_document::<AdDetails, _>(store, &ad_key(&id), |d| {
                    d.description = Some(ad_text)
                })
                .await?;
            }
            AdEvent::ClassifiedAdPriceUpdated {
                id,
                price,
                currency_code,
            } => {
                update_document::<AdDetails, _>(store, &ad_key(&id), |d| {
                    d.price = Some(price);
                    d.currency = Some(currency_code);
                })
                .await?;
            }
            AdEvent::PictureAddedToAClassifiedAd {
                classified_ad_id,
                url,
                ..
            } => {
                update_document::<AdDetails, _>(store, &ad_key(&classified_ad_id), |d| {
                    if !d.photo_urls.contains(&url) {
                        d.photo_urls.push(url);
                    }
                })
                .await?;
            }
            AdEvent::ClassifiedAdDeleted { id } => {
                store.delete(&ad_key(&id)).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct UserDetailsProjection {
    documents: InMemoryDocumentStore,
}

impl UserDetailsProjection {
    pub fn new(documents: InMemoryDocumentStore) -> Self {
        Self { documents }
    }
}

#[async_trait::async_trait]
impl Projection for UserDetailsProjection {
    fn name(&self) -> &str {
        "user_details"
    }

    fn handles(&self, event_type: &str) -> bool {
        ProfileEvent::EVENT_TYPES.contains(&event_type)
    }

    async fn project(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let store: &dyn DocumentStore = &self.documents;
        match decode::<ProfileEvent>(event)? {
            ProfileEvent::UserRegistered {
                user_id,
                display_name,
                ..
            } => {
                if load_document::<UserDetails>(store, &user_key(&user_id))
                    .await?
                    .is_none()
                {
                    let details = UserDetails {
                        id: user_id.clone(),
                        display_name,
                        photo_url: None,
                    };
                    save_document(store, &user_key(&user_id), &details).await?;
                }
            }
            ProfileEvent::UserDisplayNameUpdated {
                user_id,
                display_name,
            } => {
                update_document::<UserDetails, _>(store, &user_key(&user_id), |d| {
                    d.display_name = display_name
                })
                .await?;
            }
            ProfileEvent::ProfilePhotoUploaded { user_id, photo_url } => {
                update_document::<UserDetails, _>(store, &user_key(&user_id), |d| {
                    d.photo_url = Some(photo_url)
                })
                .await?;
            }
            ProfileEvent::UserFullNameUpdated { .. } => {}
        }
        Ok(())
    }
}

pub struct MyClassifiedAdsProjection {
    documents: InMemoryDocumentStore,
}

impl MyClassifiedAdsProjection {
    pub fn new(documents: InMemoryDocumentStore) -> Self {
        Self { documents }
    }
}

#[async_trait::async_trait]
impl Projection for MyClassifiedAdsProjection {
    fn name(&self) -> &str {
        "my_classified_ads"
    }

    fn handles(&self, event_type: &str) -> bool {
        matches!(event_type, "ClassifiedAdCreated" | "ClassifiedAdDeleted")
    }

    async fn project(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let store: &dyn DocumentStore = &self.documents;
        match decode::<AdEvent>(event)? {
            AdEvent::ClassifiedAdCreated { id, owner_id } => {
                let key = my_ads_key(&owner_id);
                let mut mine = load_document::<MyAds>(store, &key)
                    .await?
                    .unwrap_or_else(|| MyAds {
                        id: owner_id.clone(),
                        ads: Vec::new(),
                    });
                if !mine.ads.contains(&id) {
                    mine.ads.push(id);
                    save_document(store, &key, &mine).await?;
                }
            }
            AdEvent::ClassifiedAdDeleted { id } => {
                for key in self.documents.keys_with_prefix("my_classified_ads/").await {
                    update_document::<MyAds, _>(store, &key, |m| m.ads.retain(|a| a != &id))
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Republishes `ClassifiedAdPublished` as `ClassifiedAdPublishedV2` carrying
/// the seller's photo from the user read model.
pub fn ad_upcaster(
    backend: Arc<dyn EventStreamBackend>,
    documents: InMemoryDocumentStore,
) -> Upcaster {
    Upcaster::new("classified_ad_upcaster", UPCASTED_STREAM, backend).rule(
        "ClassifiedAdPublished",
        move |event: RecordedEvent| {
            let documents = documents.clone();
            Box::pin(async move {
                let AdEvent::ClassifiedAdPublished {
                    id,
                    owner_id,
                    approved_by,
                } = decode::<AdEvent>(&event)?
                else {
                    return Ok(None);
                };
                let seller = load_document::<UserDetails>(&documents, &user_key(&owner_id)).await?;
                Ok(Some(UpcastEvent {
                    event_type: "ClassifiedAdPublishedV2".into(),
                    payload: serde_json::json!({
                        "id": id,
                        "owner_id": owner_id,
                        "approved_by": approved_by,
                        "seller_photo_url": seller.and_then(|s| s.photo_url),
                    }),
                }))
            })
        },
    )
}
