use crate::models::order::OrderStatus;

pub fn progress_percentage(status: OrderStatus) -> u8 {
    match status {
        OrderStatus::Pending => 10,
        OrderStatus::Confirmed => 20,
        OrderStatus::Preparing => 50,
        OrderStatus::Ready => 80,
        OrderStatus::OutForDelivery => 90,
        OrderStatus::Delivered => 100,
        OrderStatus::Cancelled | OrderStatus::Unknown => 0,
    }
}
