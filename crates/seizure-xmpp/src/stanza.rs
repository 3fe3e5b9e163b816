//! IQ reply construction.

use minidom::Element;

use crate::parser::ns;

/// Build a reply to an IQ `request`.
///
/// The reply keeps the request id and swaps `to`/`from`, so it travels back
/// to the original sender.
pub fn iq_reply(
    request: &Element,
    iq_type: &str,
    children: impl IntoIterator<Item = Element>,
) -> Element {
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT).attr("type", iq_type);

    if let Some(id) = request.attr("id") {
        builder = builder.attr("id", id);
    }
    if let Some(from) = request.attr("from") {
        builder = builder.attr("to", from);
    }
    if let Some(to) = request.attr("to") {
        builder = builder.attr("from", to);
    }

    for child in children {
        builder = builder.append(child);
    }

    builder.build()
}

/// Build a `type='result'` reply carrying an optional payload.
pub fn iq_result(request: &Element, payload: Option<Element>) -> Element {
    iq_reply(request, "result", payload)
}
