//! Async pull of tokenizer events off a transport.
//!
//! Thin wrapper around [`rxml::AsyncReader`] that adds the two operations
//! XMPP needs beyond plain parsing: a parser restart that keeps already
//! buffered input (stream restart after STARTTLS/SASL), and recovery of the
//! underlying transport for the TLS handshake itself.

use std::pin::Pin;

use futures::future::poll_fn;
use tokio::io::{AsyncRead, BufReader};

/// Event reader over any async byte source.
pub struct XmlReader<Io> {
    inner: rxml::AsyncReader<BufReader<Io>>,
}

impl<Io: AsyncRead + Unpin> XmlReader<Io> {
    /// Wrap a transport in a fresh reader.
    pub fn new(io: Io) -> XmlReader<Io> {
        XmlReader {
            inner: rxml::AsyncReader::wrap(BufReader::new(io), rxml::Parser::default()),
        }
    }

    /// Read the next tokenizer event.
    ///
    /// `Ok(None)` means the source reached end-of-file at a document
    /// boundary. Tokenization failures arrive as `std::io::Error` wrapping
    /// an [`rxml::Error`]; see `DecodeError::from_read`.
    pub async fn next_event(&mut self) -> std::io::Result<Option<rxml::Event>> {
        poll_fn(|cx| Pin::new(&mut self.inner).poll_read(cx)).await
    }

    /// Replace the parser state, expecting a new XML prolog or stream
    /// header next. Input already buffered from the transport is kept.
    pub fn restart(&mut self) {
        *Pin::new(&mut self.inner).parser_pinned() = rxml::Parser::default();
    }

    /// Tear down the reader and hand the raw transport back.
    ///
    /// Any internally buffered bytes are discarded, so this is only called
    /// at protocol points where the peer is known to be waiting on us
    /// (immediately after `<starttls/>` was answered with `<proceed/>`).
    pub fn into_inner(self) -> Io {
        let (buffered, _parser) = self.inner.into_inner();
        buffered.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_events_from_a_slice() {
        let mut reader = XmlReader::new("<a xmlns='urn:test'><b/></a>".as_bytes());
        let mut starts = 0;
        let mut ends = 0;
        while let Some(event) = reader.next_event().await.unwrap() {
            match event {
                rxml::Event::StartElement(..) => starts += 1,
                rxml::Event::EndElement(..) => ends += 1,
                _ => {}
            }
        }
        assert_eq!(starts, 2);
        assert_eq!(ends, 2);
    }

    #[tokio::test]
    async fn restart_allows_second_prolog() {
        // Two documents back-to-back in one buffer; without restart the
        // second prolog would be a well-formedness error.
        let input = "<?xml version='1.0'?><a xmlns='urn:test'/>\
                     <?xml version='1.0'?><a xmlns='urn:test'/>";
        let mut reader = XmlReader::new(input.as_bytes());

        let mut depth = 0;
        loop {
            match reader.next_event().await.unwrap() {
                Some(rxml::Event::StartElement(..)) => depth += 1,
                Some(rxml::Event::EndElement(..)) => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                Some(_) => {}
                None => panic!("first document should complete"),
            }
        }

        reader.restart();

        let mut saw_second_root = false;
        while let Some(event) = reader.next_event().await.unwrap() {
            if matches!(event, rxml::Event::StartElement(..)) {
                saw_second_root = true;
            }
        }
        assert!(saw_second_root);
    }
}
