//! Venue trade return codes
//!
//! The terminal reports a numeric retcode next to the textual status. Only
//! the description is kept; callers fold it into close reasons.

/// Human-readable description of a venue retcode, if known.
pub fn describe(code: i32) -> Option<&'static str> {
    let text = match code {
        10004 => "Requote",
        10006 => "Request rejected",
        10007 => "Request canceled by trader",
        10008 => "Order placed",
        10009 => "Request completed",
        10010 => "Only part of the request was completed",
        10011 => "Request processing error",
        10012 => "Request canceled by timeout",
        10013 => "Invalid request",
        10014 => "Invalid volume in the request",
        10015 => "Invalid price in the request",
        10016 => "Invalid stops in the request",
        10017 => "Trade is disabled",
        10018 => "Market is closed",
        10019 => "There is not enough money to complete the request",
        10020 => "Prices changed",
        10021 => "There are no quotes to process the request",
        10022 => "Invalid order expiration date in the request",
        10023 => "Order state changed",
        10024 => "Too frequent requests",
        10025 => "No changes in request",
        10026 => "Autotrading disabled by server",
        10027 => "Autotrading disabled by client terminal",
        10028 => "Request locked for processing",
        10029 => "Order or position frozen",
        10030 => "Invalid order filling type",
        10031 => "No connection with the trade server",
        10032 => "Operation is allowed only for live accounts",
        10033 => "The number of pending orders has reached the limit",
        10034 => "The volume of orders and positions for the symbol has reached the limit",
        10035 => "Incorrect or prohibited order type",
        10036 => "Position with the specified identifier has already been closed",
        10038 => "A close volume exceeds the current position volume",
        10039 => "A close order already exists for this position",
        10040 => "The number of open positions has reached the limit",
        10041 => "The pending order activation request is rejected, the order is canceled",
        10042 => "Only long positions are allowed",
        10043 => "Only short positions are allowed",
        10044 => "Only position closing is allowed",
        10045 => "Position closing is allowed only by FIFO rule",
        10046 => "Opposite positions on a single symbol are disabled",
        _ => return None,
    };
    Some(text)
}

/// Close reason for a rejected trade: the venue status, plus the retcode
/// description when one is reported.
pub fn rejection_reason(status: &str, retcode: Option<i32>) -> String {
    match retcode.and_then(|c| describe(c).map(|d| (c, d))) {
        Some((code, text)) => format!("{}: {} ({})", status, text, code),
        None => status.to_string(),
    }
}
