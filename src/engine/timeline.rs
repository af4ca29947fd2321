use serde::Serialize;

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKey {
    Placed,
    Confirmed,
    Preparing,
    Ready,
    OutForDelivery,
    Delivered,
}

impl StageKey {
    /// Stage an order status sits on. `cancelled` and unknown statuses have none.
    pub fn for_status(status: OrderStatus) -> Option<StageKey> {
        match status {
            OrderStatus::Pending => Some(StageKey::Placed),
            OrderStatus::Confirmed => Some(StageKey::Confirmed),
            OrderStatus::Preparing => Some(StageKey::Preparing),
            OrderStatus::Ready => Some(StageKey::Ready),
            OrderStatus::OutForDelivery => Some(StageKey::OutForDelivery),
            OrderStatus::Delivered => Some(StageKey::Delivered),
            OrderStatus::Cancelled | OrderStatus::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Completed,
    Current,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub key: StageKey,
    pub label: &'static str,
    pub description: &'static str,
}

pub const STAGES: [Stage; 6] = [
    Stage {
        key: StageKey::Placed,
        label: "Order placed",
        description: "We have received your order",
    },
    Stage {
        key: StageKey::Confirmed,
        label: "Confirmed",
        description: "The restaurant accepted your order",
    },
    Stage {
        key: StageKey::Preparing,
        label: "Preparing",
        description: "Your food is being prepared",
    },
    Stage {
        key: StageKey::Ready,
        label: "Ready",
        description: "Your order is ready for pickup by the driver",
    },
    Stage {
        key: StageKey::OutForDelivery,
        label: "Out for delivery",
        description: "Your driver is on the way",
    },
    Stage {
        key: StageKey::Delivered,
        label: "Delivered",
        description: "Enjoy your meal",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassifiedStage {
    #[serde(flatten)]
    pub stage: Stage,
    pub state: StageState,
}

/// Classifies every stage against `status`, in sequence order.
///
/// Stages up to and including the matched one are completed, the stage right
/// after it is current, and the rest are pending. A status with no stage leaves
/// every stage pending.
pub fn classify(stages: &[Stage], status: OrderStatus) -> Vec<ClassifiedStage> {
    let matched = StageKey::for_status(status)
        .and_then(|key| stages.iter().position(|stage| stage.key == key));

    stages
        .iter()
        .enumerate()
        .map(|(index, stage)| {
            let state = match matched {
                Some(m) if index <= m => StageState::Completed,
                Some(m) if index == m + 1 => StageState::Current,
                _ => StageState::Pending,
            };
            ClassifiedStage {
                stage: *stage,
                state,
            }
        })
        .collect()
}
