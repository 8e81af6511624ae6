//! Inbound and outbound filter-chain pipeline
//!
//! Inbound, each stage keeps a [`FilterContext`] per channel: the bytes of a
//! message that has not fully arrived and, once known, its length. New bytes
//! are appended to that context and carved into complete messages with the
//! stage's `tell_boundary`; every complete message goes through the stage's
//! `on_msg_arrive` and its outputs recurse into the next stage. Messages
//! surviving the last stage are delivered to the service in order.
//!
//! Outbound, a queued message departs through the filters below the stage
//! it was queued at, in reverse order, and the resulting fragments are merged
//! into one buffer for the socket.
//!
//! Only the read task of a channel runs the inbound side and there is at
//! most one per channel, so contexts are never touched concurrently.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use bytes::Bytes;
use log::{error, trace};

use super::Channel;
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::filter::{Boundary, ChainSnapshot, Message, Session};

/// Partial message parked by one stage between reads
#[derive(Debug, Default)]
pub(crate) struct FilterContext {
    pending: Buffer,
    /// Length of the message being assembled; 0 while unknown.
    msg_len: usize,
}

impl FilterContext {
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Runs one read's worth of fragments through the whole chain.
pub(crate) fn receive(channel: &Channel, chain: &ChainSnapshot, fragments: Vec<Bytes>) -> Result<()> {
    let input = fragments.into_iter().map(Message::Bytes).collect();
    inbound(channel, chain, 0, input)
}

fn inbound(channel: &Channel, chain: &ChainSnapshot, stage: usize, input: Vec<Message>) -> Result<()> {
    if stage >= chain.len() {
        for msg in input {
            if channel.is_closed() {
                break;
            }
            deliver(channel, msg);
        }
        return Ok(());
    }

    let entry = &chain[stage];
    let session = Session::new(channel, entry);
    let filter = entry.filter();
    let min_size = filter.msg_min_size();

    let saved = channel.take_context(entry.slot());
    let (mut pending, mut msg_len) = saved
        .map(|ctx| (ctx.pending, ctx.msg_len))
        .unwrap_or_default();
    let mut queue: VecDeque<Message> = input.into();

    // A close from a handler drops the rest of the read and the parked context
    while let Some(msg) = queue.pop_front() {
        if channel.is_closed() {
            return Ok(());
        }
        let bytes = match msg {
            Message::Bytes(bytes) => bytes,
            object => {
                arrive_one(channel, chain, stage, object)?;
                continue;
            }
        };
        pending.merge_bytes(bytes);

        loop {
            if msg_len == 0 {
                if pending.is_empty() || pending.len() < min_size {
                    break;
                }
                let boundary = catch_unwind(AssertUnwindSafe(|| {
                    filter.tell_boundary(&session, pending.as_slice())
                }));
                match boundary {
                    Ok(Boundary::Underflow) | Ok(Boundary::Length(0)) => break,
                    Ok(Boundary::Length(len)) => msg_len = len,
                    Ok(Boundary::Error) => {
                        return Err(Error::Framing {
                            filter: entry.name().to_string(),
                        })
                    }
                    Err(payload) => {
                        error!(
                            "boundary check of filter `{}` panicked on channel {}: {}",
                            entry.name(),
                            channel.id(),
                            Error::from_panic(payload)
                        );
                        return Err(Error::Framing {
                            filter: entry.name().to_string(),
                        });
                    }
                }
            }

            if pending.len() < msg_len {
                // Short: pull in the next fragment of this read, if it is bytes
                if matches!(queue.front(), Some(Message::Bytes(_))) {
                    if let Some(Message::Bytes(next)) = queue.pop_front() {
                        pending.merge_bytes(next);
                        continue;
                    }
                }
                break;
            }

            let frame = pending.split_to(msg_len);
            msg_len = 0;
            trace!(
                "filter `{}` framed {} bytes on channel {}",
                entry.name(),
                frame.len(),
                channel.id()
            );
            arrive_one(channel, chain, stage, Message::Bytes(frame))?;
            if channel.is_closed() {
                return Ok(());
            }
        }
    }

    if !pending.is_empty() || msg_len != 0 {
        channel.store_context(entry.slot(), FilterContext { pending, msg_len });
    }
    Ok(())
}

fn arrive_one(channel: &Channel, chain: &ChainSnapshot, stage: usize, msg: Message) -> Result<()> {
    let entry = &chain[stage];
    let session = Session::new(channel, entry);
    let mut output = Vec::new();

    let result = catch_unwind(AssertUnwindSafe(|| {
        entry.filter().on_msg_arrive(&session, msg, &mut output)
    }));
    match result {
        Ok(Ok(true)) => {
            if output.is_empty() {
                Ok(())
            } else {
                inbound(channel, chain, stage + 1, output)
            }
        }
        Ok(Ok(false)) if output.is_empty() => Err(Error::Rejected {
            filter: entry.name().to_string(),
        }),
        Ok(Ok(false)) => {
            trace!(
                "filter `{}` turned {} message(s) around on channel {}",
                entry.name(),
                output.len(),
                channel.id()
            );
            for reply in output {
                channel.enqueue(reply, chain.clone(), stage)?;
            }
            Ok(())
        }
        Ok(Err(err)) if err.is_fatal() => Err(err),
        Ok(Err(err)) => {
            channel.raise(err);
            Ok(())
        }
        Err(payload) => {
            channel.raise(Error::from_panic(payload));
            Ok(())
        }
    }
}

fn deliver(channel: &Channel, msg: Message) {
    let service = channel.service().clone();
    let result = catch_unwind(AssertUnwindSafe(|| service.on_message_received(channel, msg)));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => channel.raise(err),
        Err(payload) => channel.raise(Error::from_panic(payload)),
    }
}

/// Runs `msg` through filters `index-1 ..= 0` and merges the result.
///
/// `Ok(None)` when a filter dropped the message.
pub(crate) fn depart(channel: &Channel, chain: &ChainSnapshot, index: usize, msg: Message) -> Result<Option<Bytes>> {
    let mut msgs = vec![msg];
    for entry in chain[..index.min(chain.len())].iter().rev() {
        let session = Session::new(channel, entry);
        let mut next = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let mut output = Vec::new();
            let result = catch_unwind(AssertUnwindSafe(|| {
                entry.filter().on_msg_depart(&session, msg, &mut output)
            }));
            match result {
                Ok(Ok(true)) => next.append(&mut output),
                Ok(Ok(false)) => {
                    trace!("filter `{}` dropped an outbound message on channel {}", entry.name(), channel.id());
                    return Ok(None);
                }
                Ok(Err(err)) => return Err(err),
                Err(payload) => return Err(Error::from_panic(payload)),
            }
        }
        msgs = next;
    }

    let mut frames = Vec::with_capacity(msgs.len());
    for msg in msgs {
        match msg {
            Message::Bytes(bytes) => frames.push(bytes),
            Message::Object(_) => return Err(Error::Unencoded(channel.id())),
        }
    }
    let merged = match frames.len() {
        0 => Bytes::new(),
        1 => frames.swap_remove(0),
        _ => {
            let mut buf = Buffer::with_capacity(frames.iter().map(Bytes::len).sum());
            for frame in frames {
                buf.merge_bytes(frame);
            }
            buf.freeze()
        }
    };
    Ok(Some(merged))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::channel::testing::Harness;
    use crate::error::{Error, Result};
    use crate::filter::codec::{payload, LengthFieldFilter, LineFilter};
    use crate::filter::{Filter, FilterChain, Message, Session};

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn length_chain() -> FilterChain {
        FilterChain::from_filters([("length", Arc::new(LengthFieldFilter::new(4)) as Arc<dyn Filter>)]).unwrap()
    }

    /// Answers `HELLO` itself and passes everything else up.
    struct Greeter;

    impl Filter for Greeter {
        fn on_msg_arrive(&self, _session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
            if payload(&msg) == b"HELLO" {
                output.push(Message::from("WELCOME"));
                return Ok(false);
            }
            output.push(msg);
            Ok(true)
        }
    }

    struct Bouncer;

    impl Filter for Bouncer {
        fn on_msg_arrive(&self, _session: &Session<'_>, _msg: Message, _output: &mut Vec<Message>) -> Result<bool> {
            Ok(false)
        }
    }

    struct Picky;

    impl Filter for Picky {
        fn on_msg_arrive(&self, session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
            if payload(&msg) == b"bad" {
                return Err(Error::filter(session.filter_name(), "bad payload"));
            }
            output.push(msg);
            Ok(true)
        }
    }

    /// Prefixes each message with how many this channel has seen so far.
    struct Counter;

    impl Filter for Counter {
        fn on_msg_arrive(&self, session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
            let n = session.with_state(|count: &mut u32| {
                *count += 1;
                *count
            });
            let text = format!("{n}:{}", String::from_utf8_lossy(payload(&msg)));
            output.push(Message::from(text));
            Ok(true)
        }
    }

    /// Decodes UTF-8 payloads into `String` objects.
    struct Utf8Decoder;

    impl Filter for Utf8Decoder {
        fn on_msg_arrive(&self, session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
            let text = std::str::from_utf8(payload(&msg))
                .map_err(|e| Error::filter(session.filter_name(), e))?
                .to_string();
            output.push(Message::object(text));
            Ok(true)
        }
    }

    #[test]
    fn test_frame_split_across_two_reads() {
        let h = Harness::new(length_chain()).open();
        h.channel.feed(&[0, 0, 0, 7]);
        assert!(h.service.payloads().is_empty());
        assert_eq!(h.channel.buffered_input(), 4);

        h.channel.feed(b"HELLO!?");
        assert_eq!(h.service.payloads(), vec![b"HELLO!?".to_vec()]);
        assert_eq!(h.channel.buffered_input(), 0);
    }

    #[test]
    fn test_trailing_byte_stays_buffered() {
        let h = Harness::new(length_chain()).open();
        h.channel.feed(&[0, 0, 0, 7, b'H', b'E', b'L']);
        h.channel.feed(&[b'L', b'O', b'!', b'?', 0]);
        assert_eq!(h.service.payloads(), vec![b"HELLO!?".to_vec()]);
        assert_eq!(h.channel.buffered_input(), 1);
    }

    #[test]
    fn test_several_frames_in_one_read_keep_order() {
        let h = Harness::new(length_chain()).open();
        let mut data = frame(b"one");
        data.extend(frame(b""));
        data.extend(frame(b"three"));
        h.channel.feed(&data);
        assert_eq!(
            h.service.payloads(),
            vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]
        );
    }

    #[test]
    fn test_each_stage_keeps_its_own_partial_message() {
        let chain = length_chain();
        chain.add_last("lines", Arc::new(LineFilter::new())).unwrap();
        let h = Harness::new(chain).open();

        h.channel.feed(&frame(b"ab"));
        h.channel.feed(&frame(b"c\nd"));
        assert_eq!(h.service.payloads(), vec![b"abc".to_vec()]);
        h.channel.feed(&frame(b"\n"));
        assert_eq!(h.service.payloads(), vec![b"abc".to_vec(), b"d".to_vec()]);
        assert_eq!(h.channel.buffered_input(), 0);
    }

    #[test]
    fn test_corrupt_input_closes_the_channel() {
        let chain = FilterChain::new();
        chain
            .add_last("length", Arc::new(LengthFieldFilter::new(2).with_max_frame(8)))
            .unwrap();
        let h = Harness::new(chain).open();
        h.channel.feed(&[0, 200, 1, 2, 3]);

        assert!(h.channel.is_closed());
        assert_eq!(h.service.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.admin.closes.load(Ordering::SeqCst), 1);
        assert!(*h.socket.shut_down.lock());
        let errors = h.service.errors.lock().clone();
        assert_eq!(errors, vec!["framing error in filter `length`".to_string()]);
    }

    #[test]
    fn test_rejection_without_output_is_fatal() {
        let chain = length_chain();
        chain.add_last("bouncer", Arc::new(Bouncer)).unwrap();
        let h = Harness::new(chain).open();
        h.channel.feed(&frame(b"knock"));

        assert!(h.channel.is_closed());
        assert!(h.service.payloads().is_empty());
        assert_eq!(
            h.service.errors.lock().clone(),
            vec!["filter `bouncer` rejected the message".to_string()]
        );
    }

    #[test]
    fn test_filter_answers_through_lower_stages() {
        let chain = length_chain();
        chain.add_last("greeter", Arc::new(Greeter)).unwrap();
        let h = Harness::new(chain).open();

        h.channel.feed(&frame(b"HELLO"));
        assert!(h.service.payloads().is_empty());
        h.admin.run_all();
        assert_eq!(h.socket.written(), frame(b"WELCOME"));
        let sent: Vec<_> = h.service.sent.lock().iter().map(|m| payload(m).to_vec()).collect();
        assert_eq!(sent, vec![b"WELCOME".to_vec()]);

        h.channel.feed(&frame(b"data"));
        assert_eq!(h.service.payloads(), vec![b"data".to_vec()]);
        assert!(h.channel.is_open());
    }

    #[test]
    fn test_handler_error_is_reported_and_processing_continues() {
        let chain = length_chain();
        chain.add_last("picky", Arc::new(Picky)).unwrap();
        let h = Harness::new(chain).open();

        let mut data = frame(b"bad");
        data.extend(frame(b"ok"));
        h.channel.feed(&data);

        assert!(h.channel.is_open());
        assert_eq!(h.service.payloads(), vec![b"ok".to_vec()]);
        assert_eq!(
            h.service.errors.lock().clone(),
            vec!["filter `picky` failed: bad payload".to_string()]
        );
    }

    #[test]
    fn test_close_from_handler_stops_the_read() {
        let chain = length_chain();
        chain.add_last("counter", Arc::new(Counter)).unwrap();
        let h = Harness::new(chain).open();
        h.service.close_on_receive.store(true, Ordering::SeqCst);

        let mut data = frame(b"a");
        data.extend(frame(b"b"));
        data.extend(frame(b"c"));
        data.extend_from_slice(&[0, 0, 0, 9, b'x']);
        h.channel.feed(&data);

        assert!(h.channel.is_closed());
        assert_eq!(h.service.payloads(), vec![b"1:a".to_vec()]);
        assert_eq!(h.service.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.channel.buffered_input(), 0);
        assert!(h.service.errors.lock().is_empty());
    }

    #[test]
    fn test_service_panic_is_contained() {
        let h = Harness::new(length_chain()).open();
        *h.service.panic_on.lock() = Some(b"boom".to_vec());

        let mut data = frame(b"boom");
        data.extend(frame(b"after"));
        h.channel.feed(&data);

        assert!(h.channel.is_open());
        assert_eq!(h.service.payloads(), vec![b"after".to_vec()]);
        let errors = h.service.errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("handler panicked"), "{errors:?}");
    }

    #[test]
    fn test_filter_state_is_per_channel() {
        let counting = || {
            let chain = length_chain();
            chain.add_last("counter", Arc::new(Counter)).unwrap();
            Harness::new(chain).open()
        };
        let first = counting();
        let second = counting();

        first.channel.feed(&frame(b"a"));
        first.channel.feed(&frame(b"b"));
        second.channel.feed(&frame(b"c"));
        assert_eq!(first.service.payloads(), vec![b"1:a".to_vec(), b"2:b".to_vec()]);
        assert_eq!(second.service.payloads(), vec![b"1:c".to_vec()]);
    }

    #[test]
    fn test_decoded_objects_reach_the_service() {
        let chain = length_chain();
        chain.add_last("utf8", Arc::new(Utf8Decoder)).unwrap();
        let h = Harness::new(chain).open();
        h.channel.feed(&frame("héllo".as_bytes()));

        let received = h.service.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].downcast_ref::<String>().map(String::as_str), Some("héllo"));
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_messages(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 0..12),
            cuts in prop::collection::vec(1usize..17, 1..32),
        ) {
            let stream: Vec<u8> = payloads.iter().flat_map(|p| frame(p)).collect();
            let h = Harness::new(length_chain()).open();

            let mut rest = &stream[..];
            let mut sizes = cuts.iter().cycle();
            while !rest.is_empty() {
                let n = sizes.next().copied().unwrap_or(1).min(rest.len());
                h.channel.feed(&rest[..n]);
                rest = &rest[n..];
            }

            prop_assert_eq!(h.service.payloads(), payloads);
            prop_assert_eq!(h.channel.buffered_input(), 0);
            prop_assert!(h.channel.is_open());
        }

        #[test]
        fn prop_byte_at_a_time_lines(lines in prop::collection::vec("[a-z ]{0,12}", 1..8)) {
            let chain = FilterChain::new();
            chain.add_last("lines", Arc::new(LineFilter::new())).unwrap();
            let h = Harness::new(chain).open();

            let text: String = lines.iter().map(|l| format!("{l}\r\n")).collect();
            for byte in text.as_bytes() {
                h.channel.feed(&[*byte]);
            }

            let expected: Vec<Vec<u8>> = lines.iter().map(|l| l.as_bytes().to_vec()).collect();
            prop_assert_eq!(h.service.payloads(), expected);
            prop_assert_eq!(h.channel.buffered_input(), 0);
        }
    }
}
