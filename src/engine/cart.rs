//! Listings and cart reservations.
//!
//! A cart soft-holds stock: every quantity in an active cart is counted in
//! `Product::reserved` until the cart is checked out, cleared or expires.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{AccessError, CartError, Engine, EngineError};
use crate::Quantity;
use crate::config::{SellerConflictPolicy, TtlPolicy};
use crate::model::{
    Cart, CartId, CartItem, CartStatus, CartView, Context, ItemId, NewProduct, Product, ProductId,
    Role, UserId,
};

impl Engine {
    /// Create a listing or update one the caller already owns.
    pub fn upsert_product(
        &mut self,
        ctx: &Context,
        listing: NewProduct,
    ) -> Result<Product, EngineError> {
        Self::require_role(ctx, Role::Seller)?;
        self.authorize(ctx)?;

        let invalid = |message: &str| CartError::InvalidListing {
            product: listing.id,
            message: message.to_string(),
        };
        if !listing.unit_price.is_positive() {
            return Err(invalid("unit price must be positive").into());
        }
        if listing.stock < Quantity::ZERO || listing.min_order < Quantity::ZERO {
            return Err(invalid("stock and minimum order must not be negative").into());
        }

        let product = match self.products.get_mut(&listing.id) {
            Some(existing) => {
                if existing.seller != ctx.actor.id {
                    return Err(AccessError::NotOwner {
                        product: listing.id,
                        user: ctx.actor.id,
                    }
                    .into());
                }
                if listing.stock < existing.reserved {
                    return Err(invalid("stock is below the quantity held in carts").into());
                }
                existing.name = listing.name;
                existing.unit = listing.unit;
                existing.unit_price = listing.unit_price;
                existing.stock = listing.stock;
                existing.min_order = listing.min_order;
                existing.listed = listing.listed;
                existing.clone()
            }
            None => {
                let product = Product {
                    id: listing.id,
                    seller: ctx.actor.id,
                    name: listing.name,
                    unit: listing.unit,
                    unit_price: listing.unit_price,
                    stock: listing.stock,
                    reserved: Quantity::ZERO,
                    min_order: listing.min_order,
                    listed: listing.listed,
                };
                self.products.insert(product.id, product.clone());
                product
            }
        };
        Ok(product)
    }

    /// The caller's active cart, if any.
    pub fn cart(&mut self, ctx: &Context) -> Result<Option<CartView>, EngineError> {
        Self::require_role(ctx, Role::Buyer)?;
        self.authorize(ctx)?;
        Ok(self
            .active_cart_id(ctx.actor.id, ctx.now)
            .and_then(|id| self.cart_view(id, ctx.now)))
    }

    /// Add `quantity` of a product, merging with an existing line for the same product.
    pub fn add_item(
        &mut self,
        ctx: &Context,
        product_id: ProductId,
        quantity: Quantity,
    ) -> Result<CartView, EngineError> {
        Self::require_role(ctx, Role::Buyer)?;
        self.authorize(ctx)?;
        let buyer = ctx.actor.id;
        if !quantity.is_positive() {
            return Err(CartError::NonPositiveQuantity.into());
        }
        let expires_at = self.expiry(ctx.now)?;

        let product = self
            .products
            .get(&product_id)
            .ok_or(CartError::ProductNotFound(product_id))?;
        if !product.listed {
            return Err(CartError::ProductUnavailable(product_id).into());
        }
        if product.seller == buyer {
            return Err(CartError::OwnProduct(product_id).into());
        }
        let (seller, unit_price, available, min_order) = (
            product.seller,
            product.unit_price,
            product.available(),
            product.min_order,
        );

        let mut current = self.active_cart_id(buyer, ctx.now);
        let mut replaced = None;
        if let Some(cart_id) = current {
            let active_seller = self.carts.get(&cart_id).map(|cart| cart.seller);
            if let Some(active) = active_seller.filter(|active| *active != seller) {
                match self.config.cart.seller_conflict {
                    SellerConflictPolicy::Reject => {
                        return Err(CartError::SellerConflict {
                            active,
                            requested: seller,
                        }
                        .into());
                    }
                    SellerConflictPolicy::Replace => {
                        warn!(
                            buyer,
                            cart = cart_id,
                            active,
                            requested = seller,
                            "replacing cart for another seller"
                        );
                        replaced = Some(cart_id);
                        current = None;
                    }
                }
            }
        }

        let held = current
            .and_then(|id| self.carts.get(&id))
            .and_then(|cart| cart.items.iter().find(|item| item.product == product_id))
            .map_or(Quantity::ZERO, |item| item.quantity);
        // `available` already excludes what this cart holds
        let merged = held + quantity;
        if quantity > available {
            return Err(CartError::ExceedsStock {
                product: product_id,
                requested: merged,
                available: available + held,
            }
            .into());
        }
        if merged < min_order {
            return Err(CartError::BelowMinimum {
                product: product_id,
                requested: merged,
                minimum: min_order,
            }
            .into());
        }

        if let Some(old) = replaced {
            self.close_cart(old, CartStatus::Cleared);
        }
        let cart_id = match current {
            Some(id) => id,
            None => self.open_cart(buyer, seller, ctx.now, expires_at),
        };

        let next_item = self.last_item + 1;
        let cart = self.cart_mut(cart_id, buyer)?;
        let created = match cart.items.iter_mut().find(|item| item.product == product_id) {
            Some(item) => {
                item.quantity = merged;
                false
            }
            None => {
                cart.items.push(CartItem {
                    id: next_item,
                    product: product_id,
                    quantity,
                    unit_price,
                });
                true
            }
        };
        if created {
            self.last_item = next_item;
        }
        self.hold(product_id, quantity);
        self.touch(cart_id, expires_at);

        self.cart_view(cart_id, ctx.now)
            .ok_or_else(|| CartError::NoActiveCart(buyer).into())
    }

    /// Set an item's quantity, re-checking it against stock and the minimum order.
    pub fn update_item(
        &mut self,
        ctx: &Context,
        item_id: ItemId,
        quantity: Quantity,
    ) -> Result<CartView, EngineError> {
        Self::require_role(ctx, Role::Buyer)?;
        self.authorize(ctx)?;
        let buyer = ctx.actor.id;
        if !quantity.is_positive() {
            return Err(CartError::NonPositiveQuantity.into());
        }
        let expires_at = self.expiry(ctx.now)?;

        let cart_id = self
            .active_cart_id(buyer, ctx.now)
            .ok_or(CartError::NoActiveCart(buyer))?;
        let item = self
            .carts
            .get(&cart_id)
            .and_then(|cart| cart.item(item_id))
            .ok_or(CartError::ItemNotFound(item_id))?;
        let (product_id, held) = (item.product, item.quantity);

        let product = self
            .products
            .get(&product_id)
            .ok_or(CartError::ProductNotFound(product_id))?;
        if !product.listed {
            return Err(CartError::ProductUnavailable(product_id).into());
        }
        if quantity > product.available() + held {
            return Err(CartError::ExceedsStock {
                product: product_id,
                requested: quantity,
                available: product.available() + held,
            }
            .into());
        }
        if quantity < product.min_order {
            return Err(CartError::BelowMinimum {
                product: product_id,
                requested: quantity,
                minimum: product.min_order,
            }
            .into());
        }

        if let Some(item) = self
            .cart_mut(cart_id, buyer)?
            .items
            .iter_mut()
            .find(|item| item.id == item_id)
        {
            item.quantity = quantity;
        }
        self.release_hold(product_id, held);
        self.hold(product_id, quantity);
        self.touch(cart_id, expires_at);

        self.cart_view(cart_id, ctx.now)
            .ok_or_else(|| CartError::NoActiveCart(buyer).into())
    }

    /// Remove an item. Removing an item that is not there changes nothing.
    ///
    /// The cart stays active even when its last item is removed.
    pub fn remove_item(
        &mut self,
        ctx: &Context,
        item_id: ItemId,
    ) -> Result<Option<CartView>, EngineError> {
        Self::require_role(ctx, Role::Buyer)?;
        self.authorize(ctx)?;
        let buyer = ctx.actor.id;
        let Some(cart_id) = self.active_cart_id(buyer, ctx.now) else {
            return Ok(None);
        };
        let expires_at = self.expiry(ctx.now)?;

        let cart = self.cart_mut(cart_id, buyer)?;
        if let Some(index) = cart.items.iter().position(|item| item.id == item_id) {
            let item = cart.items.remove(index);
            self.release_hold(item.product, item.quantity);
            self.touch(cart_id, expires_at);
        }
        Ok(self.cart_view(cart_id, ctx.now))
    }

    /// Drop the active cart and every hold it carries.
    pub fn clear_cart(&mut self, ctx: &Context) -> Result<(), EngineError> {
        Self::require_role(ctx, Role::Buyer)?;
        self.authorize(ctx)?;
        if let Some(cart_id) = self.active_cart_id(ctx.actor.id, ctx.now) {
            self.close_cart(cart_id, CartStatus::Cleared);
        }
        Ok(())
    }

    /// Expire every active cart whose reservation has lapsed at `now`.
    pub fn sweep_expired_carts(&mut self, now: DateTime<Utc>) -> usize {
        let lapsed: Vec<CartId> = self
            .active_carts
            .values()
            .copied()
            .filter(|id| {
                self.carts
                    .get(id)
                    .is_some_and(|cart| cart.status_at(now) == CartStatus::Expired)
            })
            .collect();

        for &id in &lapsed {
            self.close_cart(id, CartStatus::Expired);
        }
        lapsed.len()
    }

    /// The buyer's active cart, expiring it first if it has lapsed.
    pub(super) fn active_cart_id(&mut self, buyer: UserId, now: DateTime<Utc>) -> Option<CartId> {
        let id = *self.active_carts.get(&buyer)?;
        let status = self.carts.get(&id).map(|cart| cart.status_at(now));
        match status {
            Some(CartStatus::Active) => Some(id),
            Some(CartStatus::Expired) => {
                self.close_cart(id, CartStatus::Expired);
                None
            }
            _ => {
                self.active_carts.remove(&buyer);
                None
            }
        }
    }

    /// Finish a cart with `status`, releasing its holds unless it was checked out.
    pub(super) fn close_cart(&mut self, id: CartId, status: CartStatus) {
        let Some(cart) = self.carts.get_mut(&id) else {
            return;
        };
        cart.status = status;
        let buyer = cart.buyer;
        // checkout turns holds into stock deductions itself
        let holds: Vec<(ProductId, Quantity)> = if status == CartStatus::CheckedOut {
            Vec::new()
        } else {
            cart.items
                .iter()
                .map(|item| (item.product, item.quantity))
                .collect()
        };
        for (product, quantity) in holds {
            self.release_hold(product, quantity);
        }

        if self.active_carts.get(&buyer) == Some(&id) {
            self.active_carts.remove(&buyer);
        }
        info!(cart = id, buyer, ?status, "cart closed");
    }

    fn open_cart(
        &mut self,
        buyer: UserId,
        seller: UserId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CartId {
        self.last_cart += 1;
        let id = self.last_cart;
        self.carts.insert(
            id,
            Cart {
                id,
                buyer,
                seller,
                status: CartStatus::Active,
                created_at: now,
                expires_at,
                items: Vec::new(),
            },
        );
        self.active_carts.insert(buyer, id);
        debug!(cart = id, buyer, seller, "cart opened");
        id
    }

    /// Expiry for a cart created or refreshed at `now`.
    fn expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, CartError> {
        now.checked_add_signed(self.config.cart_ttl())
            .ok_or(CartError::ExpiryOutOfRange(now))
    }

    /// Record a mutation: a sliding TTL restarts at `expires_at`.
    fn touch(&mut self, id: CartId, expires_at: DateTime<Utc>) {
        if self.config.cart.ttl_policy != TtlPolicy::Sliding {
            return;
        }
        if let Some(cart) = self.carts.get_mut(&id) {
            cart.expires_at = expires_at;
        }
    }

    fn cart_mut(&mut self, id: CartId, buyer: UserId) -> Result<&mut Cart, CartError> {
        self.carts.get_mut(&id).ok_or(CartError::NoActiveCart(buyer))
    }

    fn hold(&mut self, product: ProductId, quantity: Quantity) {
        if let Some(product) = self.products.get_mut(&product) {
            product.reserved += quantity;
        }
    }

    fn release_hold(&mut self, product: ProductId, quantity: Quantity) {
        if let Some(product) = self.products.get_mut(&product) {
            product.reserved -= quantity;
        }
    }
}
