//! 优先级消息总线：频道、优先级队列、发布/订阅、请求/响应

pub mod hub;
pub mod message;
mod queue;

pub use hub::{
    BusConfig, BusError, BusStatistics, ChannelInfo, MessageBus, MessageFilter, Subscriber,
    SubscriptionId,
};
pub use message::{channels, BusMessage, MessageKind, Priority, PublishOptions};
