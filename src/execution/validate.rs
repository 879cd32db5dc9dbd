//! Placement and modification preconditions
//!
//! Pure checks, run in a fixed order so the first failing precondition is
//! the one reported.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::core::*;

/// Placement request, as handed over by the API layer or the mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceOrder {
    pub account_id: AccountId,
    pub symbol: String,
    pub side: Side,
    pub order_kind: OrderKind,
    pub leverage: u32,
    pub volume: Decimal,
    /// Must be `None` for market orders and positive otherwise
    pub entry_price: Option<Decimal>,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub expiration: Option<DateTime<Utc>>,
}

/// Price the trade is margined at, and what it costs up front.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub price: Decimal,
    pub margin: Decimal,
    pub commission: Decimal,
}

pub fn check_ownership(account: Option<Account>, id: AccountId, caller: UserId) -> Result<Account> {
    let account = account.ok_or(ValidationError::AccountNotFound(id))?;
    if account.user_id != caller {
        return Err(ValidationError::AccountNotOwned(id).into());
    }
    Ok(account)
}

/// Symbol-level restrictions: session flag, trading window, account type.
pub fn check_symbol(symbol: &Symbol, account_type: AccountType, now: DateTime<Utc>) -> Result<()> {
    if !symbol.is_trading_open {
        return Err(ValidationError::TradingClosed(symbol.name.clone()).into());
    }
    if !symbol.trading_hours.contains(now.time()) {
        return Err(ValidationError::OutsideTradingHours(symbol.name.clone()).into());
    }
    if symbol.denied_account_types.contains(&account_type) {
        return Err(ValidationError::AccountTypeDenied {
            symbol: symbol.name.clone(),
            account_type,
        }
        .into());
    }
    Ok(())
}

pub fn check_volume(volume: Decimal, symbol: &Symbol) -> Result<()> {
    if volume <= Decimal::ZERO || volume < symbol.min_volume || volume > symbol.max_volume {
        return Err(ValidationError::VolumeOutOfRange {
            volume,
            min: symbol.min_volume,
            max: symbol.max_volume,
        }
        .into());
    }
    Ok(())
}

/// Order-level checks, after the symbol checks passed.
pub fn check_order(order: &PlaceOrder, symbol: &Symbol, now: DateTime<Utc>) -> Result<()> {
    check_volume(order.volume, symbol)?;

    if order.leverage == 0 {
        return Err(ValidationError::InvalidLeverage.into());
    }
    if order.leverage > symbol.leverage {
        return Err(ValidationError::LeverageExceeded {
            requested: order.leverage,
            ceiling: symbol.leverage,
        }
        .into());
    }

    match (order.order_kind.is_market(), order.entry_price) {
        (true, Some(_)) => return Err(ValidationError::EntryPriceForbidden.into()),
        (false, None) => return Err(ValidationError::EntryPriceRequired.into()),
        (false, Some(p)) if p <= Decimal::ZERO => return Err(ValidationError::EntryPriceRequired.into()),
        _ => {}
    }

    if order.stop_loss.is_sign_negative() && !order.stop_loss.is_zero()
        || order.take_profit.is_sign_negative() && !order.take_profit.is_zero()
    {
        return Err(ValidationError::NegativeStops.into());
    }

    if order.expiration.is_some_and(|exp| exp <= now) {
        return Err(ValidationError::ExpirationInPast.into());
    }
    Ok(())
}

/// Margin at the requested price, or at the current quote for market
/// orders (ask to buy, bid to sell).
pub fn price_order(order: &PlaceOrder, symbol: &Symbol, quote: Option<&PriceTick>) -> Result<Pricing> {
    let price = match order.entry_price {
        Some(p) => p,
        None => {
            let quoted = quote.map(|q| match order.side {
                Side::Buy => q.ask,
                Side::Sell => q.bid,
            });
            match quoted {
                Some(p) if p > Decimal::ZERO => p,
                _ => return Err(ValidationError::NoReferencePrice(symbol.name.clone()).into()),
            }
        }
    };

    let overflow = || ValidationError::NotionalOverflow {
        volume: order.volume,
        price,
    };
    let margin = order
        .volume
        .checked_mul(price)
        .and_then(|notional| notional.checked_div(Decimal::from(order.leverage)))
        .ok_or_else(overflow)?;
    let commission = symbol.commission.checked_mul(order.volume).ok_or_else(overflow)?;
    // the ledger reserves both at once
    margin.checked_add(commission).ok_or_else(overflow)?;

    Ok(Pricing {
        price,
        margin,
        commission,
    })
}

/// Modification preconditions. Margin is not re-checked.
pub fn check_modify(
    trade: &Trade,
    symbol: &Symbol,
    entry_price: Option<Decimal>,
    volume: Option<Decimal>,
) -> Result<()> {
    if trade.status != TradeStatus::Pending {
        return Err(ValidationError::NotModifiable {
            id: trade.id,
            status: trade.status,
        }
        .into());
    }

    let price_changes = entry_price.is_some_and(|p| p != trade.entry_price);
    let volume_changes = volume.is_some_and(|v| v != trade.volume);
    if !price_changes && !volume_changes {
        return Err(ValidationError::NothingToModify.into());
    }

    if let Some(v) = volume {
        check_volume(v, symbol)?;
    }
    if entry_price.is_some_and(|p| p <= Decimal::ZERO) {
        return Err(ValidationError::EntryPriceRequired.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn symbol() -> Symbol {
        Symbol {
            name: "EURUSD".into(),
            leverage: 100,
            min_volume: dec!(0.01),
            max_volume: dec!(10),
            commission: dec!(0.5),
            trading_hours: TradingHours::unlimited(),
            is_trading_open: true,
            denied_account_types: vec![],
        }
    }

    fn order() -> PlaceOrder {
        PlaceOrder {
            account_id: Uuid::new_v4(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_kind: OrderKind::BuyLimit,
            leverage: 10,
            volume: dec!(1),
            entry_price: Some(dec!(100)),
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            expiration: None,
        }
    }

    fn rejection(result: Result<()>) -> ValidationError {
        match result {
            Err(Error::Validation(v)) => v,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_each_precondition_is_distinct() {
        let s = symbol();
        let now = Utc::now();

        let mut o = order();
        o.volume = dec!(11);
        assert!(matches!(rejection(check_order(&o, &s, now)), ValidationError::VolumeOutOfRange { .. }));

        let mut o = order();
        o.leverage = 200;
        assert_eq!(
            rejection(check_order(&o, &s, now)),
            ValidationError::LeverageExceeded { requested: 200, ceiling: 100 }
        );

        let mut o = order();
        o.order_kind = OrderKind::Market;
        assert_eq!(rejection(check_order(&o, &s, now)), ValidationError::EntryPriceForbidden);

        let mut o = order();
        o.entry_price = None;
        assert_eq!(rejection(check_order(&o, &s, now)), ValidationError::EntryPriceRequired);

        let mut o = order();
        o.take_profit = dec!(-1);
        assert_eq!(rejection(check_order(&o, &s, now)), ValidationError::NegativeStops);

        let mut o = order();
        o.expiration = Some(now - Duration::seconds(1));
        assert_eq!(rejection(check_order(&o, &s, now)), ValidationError::ExpirationInPast);

        assert!(check_order(&order(), &s, now).is_ok());
    }

    #[test]
    fn test_symbol_restrictions() {
        let now = Utc::now();
        let mut s = symbol();
        s.denied_account_types = vec![AccountType::Demo];
        assert!(matches!(
            rejection(check_symbol(&s, AccountType::Demo, now)),
            ValidationError::AccountTypeDenied { .. }
        ));
        assert!(check_symbol(&s, AccountType::Real, now).is_ok());

        s.is_trading_open = false;
        assert!(matches!(
            rejection(check_symbol(&s, AccountType::Real, now)),
            ValidationError::TradingClosed(_)
        ));
    }

    #[test]
    fn test_market_orders_use_quote() {
        let s = symbol();
        let mut o = order();
        o.order_kind = OrderKind::Market;
        o.entry_price = None;
        o.side = Side::Sell;

        assert!(matches!(
            price_order(&o, &s, None),
            Err(Error::Validation(ValidationError::NoReferencePrice(_)))
        ));

        let quote = PriceTick {
            symbol: "EURUSD".into(),
            bid: dec!(99),
            ask: dec!(101),
            timestamp: 0,
        };
        let pricing = price_order(&o, &s, Some(&quote)).unwrap();
        assert_eq!(pricing.price, dec!(99));
        assert_eq!(pricing.margin, dec!(9.9));
        assert_eq!(pricing.commission, dec!(0.5));
    }

    #[test]
    fn test_oversized_notional_is_rejected() {
        let s = symbol();
        let mut o = order();
        o.volume = dec!(10);
        o.leverage = 1;
        o.entry_price = Some(Decimal::MAX);

        assert!(matches!(
            price_order(&o, &s, None),
            Err(Error::Validation(ValidationError::NotionalOverflow { .. }))
        ));
    }
}
