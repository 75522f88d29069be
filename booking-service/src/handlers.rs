use chrono::{DateTime, Utc};
use shared::DEFAULT_CURRENCY;
use std::sync::Arc;
use tracing::{info, warn};

use crate::availability;
use crate::claim::{claim_exact, claim_first_available};
use crate::domain::{
    Booking, BookingId, CandidateQuery, Car, CarId, ClientId, CompanyId, LocationId, ModelId,
    NewBooking, RentalWindow,
};
use crate::error::BookingError;
use crate::pricing::{base_price, DiscountPolicy};
use crate::saga::{self, SagaManager};
use crate::store::{BookingStore, StoreTx};

pub const MAX_COUPON_LEN: usize = 40;
pub const NO_MATCHING_CARS: &str = "No cars of the requested model are available for this period";

/// Fields common to both ways of booking a car.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub client_id: ClientId,
    pub pickup_location_id: LocationId,
    pub return_location_id: LocationId,
    pub pickup: DateTime<Utc>,
    pub return_time: DateTime<Utc>,
    pub coupon: Option<String>,
}

impl BookingRequest {
    fn validate(&self) -> Result<RentalWindow, BookingError> {
        let window = RentalWindow::new(self.pickup, self.return_time)?;
        window.billable_days()?;
        if let Some(coupon) = &self.coupon {
            if coupon.chars().count() > MAX_COUPON_LEN {
                return Err(BookingError::validation(format!(
                    "coupon must be at most {MAX_COUPON_LEN} characters"
                )));
            }
        }
        Ok(window)
    }
}

enum Claim {
    Exact(CarId),
    FirstOf(Vec<CarId>),
}

fn quote(
    pricing: &dyn DiscountPolicy,
    client_id: ClientId,
    car: &Car,
    window: &RentalWindow,
    coupon: Option<&str>,
) -> Result<i64, BookingError> {
    let base = base_price(car.daily_price_cents, window.billable_days()?)
        .map_err(|_| BookingError::validation("rental price is out of range"))?;
    match pricing.apply_promotions(client_id, base, coupon) {
        Ok(total) => Ok(total),
        Err(e) => {
            warn!("Pricing failed for client {}, using base price: {}", client_id, e);
            Ok(base)
        }
    }
}

async fn reserve(
    tx: &mut dyn StoreTx,
    request: BookingRequest,
    window: RentalWindow,
    claim: Claim,
    pricing: Arc<dyn DiscountPolicy>,
) -> Result<Booking, BookingError> {
    if !tx.client_exists(request.client_id).await? {
        return Err(BookingError::not_found("Client", request.client_id));
    }
    for location_id in [request.pickup_location_id, request.return_location_id] {
        if !tx.location_exists(location_id).await? {
            return Err(BookingError::not_found("RentalLocation", location_id));
        }
    }

    let car = match claim {
        Claim::Exact(car_id) => claim_exact(tx, car_id, &window).await?,
        Claim::FirstOf(candidates) => claim_first_available(tx, &candidates, &window).await?,
    };
    let total_price_cents = quote(
        pricing.as_ref(),
        request.client_id,
        &car,
        &window,
        request.coupon.as_deref(),
    )?;

    let booking = tx
        .insert_booking(&NewBooking {
            client_id: request.client_id,
            car_id: car.id,
            pickup_location_id: request.pickup_location_id,
            return_location_id: request.return_location_id,
            window,
            total_price_cents,
            currency: DEFAULT_CURRENCY.to_string(),
        })
        .await?;
    saga::start_saga(tx, booking).await
}

/// Entry point for booking commands and read projections.
#[derive(Clone)]
pub struct BookingHandler<S> {
    store: S,
    saga: SagaManager<S>,
    pricing: Arc<dyn DiscountPolicy>,
    shortlist_size: i64,
}

impl<S: BookingStore> BookingHandler<S> {
    pub fn new(
        store: S,
        saga: SagaManager<S>,
        pricing: Arc<dyn DiscountPolicy>,
        shortlist_size: i64,
    ) -> Self {
        Self {
            store,
            saga,
            pricing,
            shortlist_size,
        }
    }

    pub async fn create_by_car(
        &self,
        request: BookingRequest,
        car_id: CarId,
    ) -> Result<Booking, BookingError> {
        let window = request.validate()?;
        let booking = self.book(request, window, Claim::Exact(car_id)).await?;
        info!("Booking {} created for car {}", booking.id, booking.car_id);
        Ok(booking)
    }

    pub async fn create_by_model(
        &self,
        request: BookingRequest,
        model_id: ModelId,
    ) -> Result<Booking, BookingError> {
        let window = request.validate()?;
        let candidates = availability::find_free_cars(
            &self.store,
            &CandidateQuery {
                model_id,
                location_id: request.pickup_location_id,
                window,
                limit: self.shortlist_size,
            },
        )
        .await?;
        if candidates.is_empty() {
            return Err(BookingError::business_rule(NO_MATCHING_CARS));
        }

        let booking = self
            .book(request, window, Claim::FirstOf(candidates))
            .await?;
        info!(
            "Booking {} created for model {} on car {}",
            booking.id, model_id, booking.car_id
        );
        Ok(booking)
    }

    async fn book(
        &self,
        request: BookingRequest,
        window: RentalWindow,
        claim: Claim,
    ) -> Result<Booking, BookingError> {
        let pricing = self.pricing.clone();
        self.store
            .in_transaction(move |tx| Box::pin(reserve(tx, request, window, claim, pricing)))
            .await
    }

    pub async fn cancel(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.saga.cancel(id).await
    }

    pub async fn get(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.store
            .find_booking(id)
            .await?
            .ok_or_else(|| BookingError::not_found("Booking", id))
    }

    pub async fn active_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Vec<Booking>, BookingError> {
        self.store
            .active_bookings_for_company(company_id, Utc::now())
            .await
    }

    pub async fn active_for_location(
        &self,
        location_id: LocationId,
    ) -> Result<Vec<Booking>, BookingError> {
        self.store
            .active_bookings_for_location(location_id, Utc::now())
            .await
    }

    pub async fn in_period(
        &self,
        location_id: LocationId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BookingError> {
        let window = RentalWindow::new(from, to)?;
        self.store
            .bookings_for_location_in_period(location_id, &window)
            .await
    }

    pub async fn available_cars(
        &self,
        model_id: ModelId,
        location_id: LocationId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<CarId>, BookingError> {
        let window = RentalWindow::new(from, to)?;
        availability::find_free_cars(
            &self.store,
            &CandidateQuery {
                model_id,
                location_id,
                window,
                limit: limit.unwrap_or(self.shortlist_size),
            },
        )
        .await
    }
}
