//! Order fulfillment saga over in-memory services.
//!
//! Reserve inventory, charge the customer, create a shipment. Each service
//! keys its records by saga ID, so a step invoked twice for the same saga
//! returns the original record instead of acting again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use saga::{SagaContext, SagaDefinition, Step, StepError, StepRegistry, StepResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub const SAGA_NAME: &str = "order_fulfillment";
pub const RESERVE_INVENTORY: &str = "reserve_inventory";
pub const PROCESS_PAYMENT: &str = "process_payment";
pub const CREATE_SHIPMENT: &str = "create_shipment";

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku: String,
    pub quantity: u32,
}

/// Business payload of an order fulfillment saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub customer_id: String,
    pub lines: Vec<OrderLine>,
    pub amount_cents: u64,
}

/// Failures reported by the demo services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Insufficient stock for {0}")]
    OutOfStock(String),

    #[error("Payment declined: {0}")]
    Declined(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl From<ServiceError> for StepError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(_) => StepError::retryable(err.to_string()),
            ServiceError::OutOfStock(_) | ServiceError::Declined(_) => {
                StepError::fatal(err.to_string())
            }
        }
    }
}

#[derive(Debug, Default)]
struct InventoryState {
    stock: HashMap<String, u32>,
    reservations: HashMap<String, (String, Vec<OrderLine>)>,
    next_id: u32,
}

/// In-memory stock with reservations.
#[derive(Debug, Clone, Default)]
pub struct InventoryService {
    state: Arc<RwLock<InventoryState>>,
}

impl InventoryService {
    pub fn new<I, K>(stock: I) -> Self
    where
        I: IntoIterator<Item = (K, u32)>,
        K: Into<String>,
    {
        let state = InventoryState {
            stock: stock.into_iter().map(|(sku, qty)| (sku.into(), qty)).collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Reserves every line or none. Returns the reservation ID.
    pub async fn reserve(&self, key: &str, lines: &[OrderLine]) -> Result<String, ServiceError> {
        let mut state = self.state.write().await;
        if let Some((reservation_id, _)) = state.reservations.get(key) {
            return Ok(reservation_id.clone());
        }

        for line in lines {
            let available = state.stock.get(&line.sku).copied().unwrap_or(0);
            if available < line.quantity {
                return Err(ServiceError::OutOfStock(line.sku.clone()));
            }
        }
        for line in lines {
            if let Some(available) = state.stock.get_mut(&line.sku) {
                *available -= line.quantity;
            }
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(key.to_string(), (reservation_id.clone(), lines.to_vec()));
        Ok(reservation_id)
    }

    /// Returns reserved stock. Releasing an unknown key is a no-op.
    pub async fn release(&self, key: &str) {
        let mut state = self.state.write().await;
        if let Some((_, lines)) = state.reservations.remove(key) {
            for line in lines {
                *state.stock.entry(line.sku).or_default() += line.quantity;
            }
        }
    }

    pub async fn available(&self, sku: &str) -> u32 {
        self.state.read().await.stock.get(sku).copied().unwrap_or(0)
    }

    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }
}

#[derive(Debug, Default)]
struct PaymentState {
    credit_limit_cents: u64,
    charges: HashMap<String, (String, u64)>,
    refunds: u32,
    next_id: u32,
}

/// In-memory payment gateway declining anything above a credit limit.
#[derive(Debug, Clone, Default)]
pub struct PaymentService {
    state: Arc<RwLock<PaymentState>>,
}

impl PaymentService {
    pub fn new(credit_limit_cents: u64) -> Self {
        let state = PaymentState {
            credit_limit_cents,
            ..Default::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Charges the customer. Returns the payment ID.
    pub async fn charge(
        &self,
        key: &str,
        customer_id: &str,
        amount_cents: u64,
    ) -> Result<String, ServiceError> {
        let mut state = self.state.write().await;
        if let Some((payment_id, _)) = state.charges.get(key) {
            return Ok(payment_id.clone());
        }
        if amount_cents > state.credit_limit_cents {
            return Err(ServiceError::Declined(format!(
                "{amount_cents} cents exceeds the limit for customer {customer_id}"
            )));
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state
            .charges
            .insert(key.to_string(), (payment_id.clone(), amount_cents));
        Ok(payment_id)
    }

    /// Refunds a charge. Refunding an unknown key is a no-op.
    pub async fn refund(&self, key: &str) {
        let mut state = self.state.write().await;
        if state.charges.remove(key).is_some() {
            state.refunds += 1;
        }
    }

    pub async fn charge_count(&self) -> usize {
        self.state.read().await.charges.len()
    }

    pub async fn refund_count(&self) -> u32 {
        self.state.read().await.refunds
    }
}

#[derive(Debug, Default)]
struct ShippingState {
    shipments: HashMap<String, String>,
    outages: u32,
    next_id: u32,
}

/// In-memory carrier that can be told to be unavailable for a while.
#[derive(Debug, Clone, Default)]
pub struct ShippingService {
    state: Arc<RwLock<ShippingState>>,
}

impl ShippingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` shipment requests fail transiently.
    pub async fn fail_next(&self, times: u32) {
        self.state.write().await.outages = times;
    }

    /// Creates a shipment. Returns the tracking number.
    pub async fn create_shipment(&self, key: &str, order_id: &str) -> Result<String, ServiceError> {
        let mut state = self.state.write().await;
        if let Some(tracking_number) = state.shipments.get(key) {
            return Ok(tracking_number.clone());
        }
        if state.outages > 0 {
            state.outages -= 1;
            return Err(ServiceError::Unavailable(format!(
                "carrier timeout for order {order_id}"
            )));
        }

        state.next_id += 1;
        let tracking_number = format!("TRK-{:04}", state.next_id);
        state
            .shipments
            .insert(key.to_string(), tracking_number.clone());
        Ok(tracking_number)
    }

    /// Cancels a shipment. Cancelling an unknown key is a no-op.
    pub async fn cancel_shipment(&self, key: &str) {
        self.state.write().await.shipments.remove(key);
    }

    pub async fn shipment_count(&self) -> usize {
        self.state.read().await.shipments.len()
    }
}

/// The services the demo steps call.
#[derive(Debug, Clone)]
pub struct DemoServices {
    pub inventory: InventoryService,
    pub payment: PaymentService,
    pub shipping: ShippingService,
}

impl Default for DemoServices {
    fn default() -> Self {
        Self {
            inventory: InventoryService::new([("WIDGET", 100), ("GADGET", 25)]),
            payment: PaymentService::new(100_000),
            shipping: ShippingService::new(),
        }
    }
}

fn idempotency_key(ctx: &SagaContext) -> StepResult<String> {
    ctx.saga_id()
        .map(|id| id.to_string())
        .ok_or_else(|| StepError::fatal("saga context has no saga id"))
}

struct ReserveInventory(InventoryService);

#[async_trait]
impl Step for ReserveInventory {
    fn name(&self) -> &str {
        RESERVE_INVENTORY
    }

    async fn execute(&self, ctx: &mut SagaContext) -> StepResult<Option<serde_json::Value>> {
        let order: OrderRequest = ctx.payload()?;
        let reservation_id = self.0.reserve(&idempotency_key(ctx)?, &order.lines).await?;
        ctx.insert("reservation_id", &reservation_id)?;
        Ok(Some(serde_json::json!({ "reservation_id": reservation_id })))
    }

    async fn compensate(&self, ctx: &mut SagaContext) -> StepResult<()> {
        self.0.release(&idempotency_key(ctx)?).await;
        ctx.remove("reservation_id");
        Ok(())
    }
}

struct ProcessPayment(PaymentService);

#[async_trait]
impl Step for ProcessPayment {
    fn name(&self) -> &str {
        PROCESS_PAYMENT
    }

    async fn execute(&self, ctx: &mut SagaContext) -> StepResult<Option<serde_json::Value>> {
        let order: OrderRequest = ctx.payload()?;
        let payment_id = self
            .0
            .charge(&idempotency_key(ctx)?, &order.customer_id, order.amount_cents)
            .await?;
        ctx.insert("payment_id", &payment_id)?;
        Ok(Some(serde_json::json!({ "payment_id": payment_id })))
    }

    async fn compensate(&self, ctx: &mut SagaContext) -> StepResult<()> {
        self.0.refund(&idempotency_key(ctx)?).await;
        ctx.remove("payment_id");
        Ok(())
    }
}

struct CreateShipment(ShippingService);

#[async_trait]
impl Step for CreateShipment {
    fn name(&self) -> &str {
        CREATE_SHIPMENT
    }

    async fn execute(&self, ctx: &mut SagaContext) -> StepResult<Option<serde_json::Value>> {
        let order: OrderRequest = ctx.payload()?;
        let tracking_number = self
            .0
            .create_shipment(&idempotency_key(ctx)?, &order.order_id)
            .await?;
        ctx.insert("tracking_number", &tracking_number)?;
        Ok(Some(serde_json::json!({ "tracking_number": tracking_number })))
    }

    async fn compensate(&self, ctx: &mut SagaContext) -> StepResult<()> {
        self.0.cancel_shipment(&idempotency_key(ctx)?).await;
        ctx.remove("tracking_number");
        Ok(())
    }
}

/// Registers the three order fulfillment steps.
pub fn registry(services: &DemoServices) -> saga::Result<StepRegistry> {
    StepRegistry::new()
        .with_step(ReserveInventory(services.inventory.clone()))?
        .with_step(ProcessPayment(services.payment.clone()))?
        .with_step(CreateShipment(services.shipping.clone()))
}

/// The order fulfillment saga definition.
pub fn definition(registry: &StepRegistry) -> saga::Result<SagaDefinition> {
    registry.define(
        SAGA_NAME,
        [RESERVE_INVENTORY, PROCESS_PAYMENT, CREATE_SHIPMENT],
    )
}

/// A handful of orders exercising the happy path and a declined payment.
pub fn sample_orders() -> Vec<OrderRequest> {
    vec![
        OrderRequest {
            order_id: "ORD-1001".to_string(),
            customer_id: "CUST-1".to_string(),
            lines: vec![OrderLine {
                sku: "WIDGET".to_string(),
                quantity: 2,
            }],
            amount_cents: 4_998,
        },
        OrderRequest {
            order_id: "ORD-1002".to_string(),
            customer_id: "CUST-2".to_string(),
            lines: vec![
                OrderLine {
                    sku: "WIDGET".to_string(),
                    quantity: 1,
                },
                OrderLine {
                    sku: "GADGET".to_string(),
                    quantity: 3,
                },
            ],
            amount_cents: 12_497,
        },
        OrderRequest {
            order_id: "ORD-1003".to_string(),
            customer_id: "CUST-3".to_string(),
            lines: vec![OrderLine {
                sku: "GADGET".to_string(),
                quantity: 5,
            }],
            amount_cents: 250_000,
        },
    ]
}
