//! Price-time priority order book and matching algorithm.
//!
//! Two price-indexed, time-ordered queues (bids, asks) plus an order arena
//! for O(1) lookup/removal. Matching is a pure function over an incoming
//! order and the resting book: it never touches a ledger and never blocks.

mod amount;

pub use amount::{Amount, Price, SCALE};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

pub type OrderId = u64;
pub type TradeId = u64;

/// The user's on-chain identity: a 32-byte public key.
pub type UserId = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user: UserId,
    pub side: Side,
    pub price: Price,
    pub original_quantity: Amount,
    pub remaining_quantity: Amount,
    /// Strictly increasing across the whole book; establishes time priority.
    pub created_seq: u64,
    pub status: OrderStatus,
}

impl Order {
    pub fn is_filled(&self) -> bool {
        self.remaining_quantity.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub buyer: UserId,
    pub seller: UserId,
    /// Always the maker's price (price-improvement rule).
    pub price: Price,
    pub quantity: Amount,
    pub taker_order_id: OrderId,
    pub maker_order_id: OrderId,
}

#[derive(Debug, Default)]
struct PriceLevel {
    orders: VecDeque<OrderId>,
}

pub struct OrderBook {
    // Iterated best-price-first: highest key first for bids, lowest first for asks.
    bids: BTreeMap<Price, PriceLevel>,
    asks: BTreeMap<Price, PriceLevel>,
    orders: HashMap<OrderId, Order>,
    user_orders: HashMap<UserId, BTreeSet<OrderId>>,
    next_order_id: OrderId,
    next_trade_id: TradeId,
    next_seq: u64,
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            orders: HashMap::new(),
            user_orders: HashMap::new(),
            next_order_id: 1,
            next_trade_id: 1,
            next_seq: 1,
        }
    }

    /// Allocates the `(order_id, created_seq)` pair for a new order. Called
    /// once per submission, before matching, so time priority reflects
    /// arrival order even for orders that trade away completely.
    pub fn next_ids(&mut self) -> (OrderId, u64) {
        let order_id = self.next_order_id;
        self.next_order_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        (order_id, seq)
    }

    fn next_trade_id(&mut self) -> TradeId {
        let id = self.next_trade_id;
        self.next_trade_id += 1;
        id
    }

    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    pub fn orders_for_user(&self, user: &UserId) -> impl Iterator<Item = OrderId> + '_ {
        self.user_orders
            .get(user)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Best resting price and its head (earliest-`created_seq`) order, without removing it.
    pub fn best(&self, side: Side) -> Option<(Price, OrderId)> {
        let book = self.side_book(side);
        let (price, level) = match side {
            Side::Buy => book.iter().next_back()?,
            Side::Sell => book.iter().next()?,
        };
        level.orders.front().map(|id| (*price, *id))
    }

    fn side_book(&self, side: Side) -> &BTreeMap<Price, PriceLevel> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_book_mut(&mut self, side: Side) -> &mut BTreeMap<Price, PriceLevel> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Resting orders on `side` that cross `limit_price`, best-price then
    /// earliest-`created_seq` first. Read-only: does not mutate the book.
    pub fn matchable(&self, side: Side, limit_price: Price) -> impl Iterator<Item = &Order> + '_ {
        let book = self.side_book(side);
        let crosses = move |price: &Price| match side {
            // Asks cross a Buy's limit when the ask price is at or below it.
            Side::Sell => *price <= limit_price,
            // Bids cross a Sell's limit when the bid price is at or above it.
            Side::Buy => *price >= limit_price,
        };
        let levels: Box<dyn Iterator<Item = &PriceLevel>> = match side {
            Side::Sell => Box::new(book.iter().filter(move |(p, _)| crosses(p)).map(|(_, l)| l)),
            Side::Buy => Box::new(
                book.iter()
                    .rev()
                    .filter(move |(p, _)| crosses(p))
                    .map(|(_, l)| l),
            ),
        };
        levels.flat_map(|level| level.orders.iter()).filter_map(|id| self.orders.get(id))
    }

    /// Walks resting orders on the opposite side that cross `incoming`'s
    /// limit, filling both sides and emitting one `Trade` per maker touched.
    /// Mutates resting orders in place; fully filled makers are removed from
    /// the book. Does not insert `incoming` itself — the caller rests any
    /// residual quantity via `insert`.
    pub fn match_incoming(&mut self, incoming: &mut Order) -> Vec<Trade> {
        let opposite = incoming.side.opposite();
        let mut trades = Vec::new();
        let mut emptied_prices = Vec::new();

        loop {
            if incoming.remaining_quantity.is_zero() {
                break;
            }
            let Some((maker_price, maker_id)) = self.best(opposite) else {
                break;
            };
            let crosses = match incoming.side {
                Side::Buy => maker_price <= incoming.price,
                Side::Sell => maker_price >= incoming.price,
            };
            if !crosses {
                break;
            }

            let fill = {
                let maker = self.orders.get(&maker_id).expect("book/arena out of sync");
                incoming.remaining_quantity.min(maker.remaining_quantity)
            };

            {
                let maker = self.orders.get_mut(&maker_id).expect("book/arena out of sync");
                maker.remaining_quantity = maker
                    .remaining_quantity
                    .checked_sub(fill)
                    .expect("fill never exceeds maker remaining");
            }
            incoming.remaining_quantity = incoming
                .remaining_quantity
                .checked_sub(fill)
                .expect("fill never exceeds incoming remaining");

            let maker_user = self.orders.get(&maker_id).unwrap().user;
            let (buyer, seller) = match incoming.side {
                Side::Buy => (incoming.user, maker_user),
                Side::Sell => (maker_user, incoming.user),
            };
            let trade_id = self.next_trade_id();
            trades.push(Trade {
                trade_id,
                buyer,
                seller,
                price: maker_price,
                quantity: fill,
                taker_order_id: incoming.order_id,
                maker_order_id: maker_id,
            });

            // Pop the head; a partial fill keeps its queue position (time
            // priority survives partial fills), a full fill is removed.
            {
                let level = self
                    .side_book_mut(opposite)
                    .get_mut(&maker_price)
                    .expect("level exists for head order");
                let popped = level.orders.pop_front();
                debug_assert_eq!(popped, Some(maker_id));
            }

            if self.orders.get(&maker_id).unwrap().is_filled() {
                let mut maker = self.orders.remove(&maker_id).unwrap();
                maker.status = OrderStatus::Filled;
                if let Some(set) = self.user_orders.get_mut(&maker.user) {
                    set.remove(&maker_id);
                }
            } else {
                self.orders.get_mut(&maker_id).unwrap().status = OrderStatus::PartiallyFilled;
                self.side_book_mut(opposite)
                    .get_mut(&maker_price)
                    .unwrap()
                    .orders
                    .push_front(maker_id);
            }

            if self
                .side_book_mut(opposite)
                .get(&maker_price)
                .map(|l| l.orders.is_empty())
                .unwrap_or(false)
            {
                emptied_prices.push(maker_price);
            }
        }

        let book = self.side_book_mut(opposite);
        for price in emptied_prices {
            book.remove(&price);
        }

        trades
    }

    /// Rests an order with `remaining_quantity > 0` on its own side. The
    /// caller is responsible for `status` (Open vs PartiallyFilled) and for
    /// having already reserved funds against it.
    pub fn insert(&mut self, order: Order) {
        debug_assert!(!order.remaining_quantity.is_zero());
        let side = order.side;
        let price = order.price;
        let order_id = order.order_id;
        let user = order.user;
        self.side_book_mut(side)
            .entry(price)
            .or_default()
            .orders
            .push_back(order_id);
        self.user_orders.entry(user).or_default().insert(order_id);
        self.orders.insert(order_id, order);
    }

    /// Removes a resting order (cancel). Returns the removed order.
    pub fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let order = self.orders.remove(&order_id)?;
        let book = self.side_book_mut(order.side);
        if let Some(level) = book.get_mut(&order.price) {
            level.orders.retain(|id| *id != order_id);
            if level.orders.is_empty() {
                book.remove(&order.price);
            }
        }
        if let Some(set) = self.user_orders.get_mut(&order.user) {
            set.remove(&order_id);
        }
        Some(order)
    }
}
