//! Relay engine tests against real pipes, files and PTYs

#[cfg(unix)]
mod unix_tests {
    use nix::unistd::pipe;
    use proptest::prelude::*;
    use ptyrelay_pty::Pty;
    use ptyrelay_relay::{
        LinkOutcome, RelayEngine, RelayLink, RelayReport, RunningRelay, TransferMode,
    };
    use std::fs::File;
    use std::io::{Read, Seek, Write};
    use std::os::unix::io::AsFd;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Push `data` through a single link from a pipe into a regular file
    fn relay_bytes(data: &[u8], mode: TransferMode, buffer_size: usize) -> (Vec<u8>, u64) {
        let (read, write) = pipe().unwrap();
        File::from(write).write_all(data).unwrap();

        let mut sink = tempfile::tempfile().unwrap();
        let relay = RelayEngine::new()
            .link(
                RelayLink::new("up", read.as_fd(), sink.as_fd())
                    .unwrap()
                    .transfer_mode(mode)
                    .buffer_size(buffer_size),
            )
            .start()
            .unwrap();

        let first = relay.await_any_completion();
        assert_eq!(first.outcome, LinkOutcome::Eof);
        let report = relay.shutdown();

        sink.rewind().unwrap();
        let mut copied = Vec::new();
        sink.read_to_end(&mut copied).unwrap();
        (copied, report.total_bytes())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_transfer_modes_are_byte_identical(
            data in proptest::collection::vec(any::<u8>(), 0..8192),
            buffer_size in 1usize..512,
        ) {
            let (copied, copied_bytes) = relay_bytes(&data, TransferMode::Copy, buffer_size);
            let (spliced, spliced_bytes) = relay_bytes(&data, TransferMode::Auto, buffer_size);

            prop_assert_eq!(&copied, &data);
            prop_assert_eq!(&spliced, &data);
            prop_assert_eq!(copied_bytes, data.len() as u64);
            prop_assert_eq!(spliced_bytes, data.len() as u64);
        }
    }

    #[test]
    fn test_single_byte_buffer() {
        let data = b"one byte at a time\n";
        let (copied, bytes) = relay_bytes(data, TransferMode::Copy, 1);
        assert_eq!(copied, data);
        assert_eq!(bytes, data.len() as u64);
    }

    #[test]
    fn test_slave_hangup_ends_link() {
        let pty = Pty::open().expect("Failed to create PTY");
        let mut slave = pty.open_slave().unwrap();
        slave.write_all(b"bye\n").unwrap();
        drop(slave);

        let mut sink = tempfile::tempfile().unwrap();
        let relay = RelayEngine::new()
            .link(RelayLink::new("down", pty.master(), sink.as_fd()).unwrap())
            .start()
            .unwrap();

        assert_eq!(relay.await_any_completion().outcome, LinkOutcome::Hangup);
        let report = relay.shutdown();
        assert!(report.link("down").unwrap().bytes >= 4);

        sink.rewind().unwrap();
        let mut output = String::new();
        sink.read_to_string(&mut output).unwrap();
        // The line discipline turns "\n" into "\r\n"
        assert!(output.starts_with("bye"));
    }

    #[test]
    fn test_closed_reader_is_write_failure() {
        let (read, write) = pipe().unwrap();
        File::from(write).write_all(b"nobody listens").unwrap();
        let (sink_read, sink_write) = pipe().unwrap();
        drop(sink_read);

        let relay = RelayEngine::new()
            .link(
                RelayLink::new("down", read.as_fd(), sink_write.as_fd())
                    .unwrap()
                    .transfer_mode(TransferMode::Copy),
            )
            .start()
            .unwrap();

        let first = relay.await_any_completion();
        assert_eq!(
            first.outcome,
            LinkOutcome::WriteFailed {
                errno: libc::EPIPE
            }
        );
        assert!(first.outcome.is_error());
        relay.shutdown();
    }

    #[test]
    fn test_three_links_through_pty() {
        // Mirrors a session: caller input to the master, master to caller
        // output, and a separate error pipe.
        let pty = Pty::open().expect("Failed to create PTY");
        let slave = pty.open_slave().unwrap();

        let (up_read, up_write) = pipe().unwrap();
        let (err_read, err_write) = pipe().unwrap();
        let (out_read, out_write) = pipe().unwrap();
        let (errout_read, errout_write) = pipe().unwrap();

        let relay = RelayEngine::new()
            .link(
                RelayLink::new("up", up_read.as_fd(), pty.master())
                    .unwrap()
                    .nonblocking_output(true),
            )
            .link(
                RelayLink::new("down", pty.master(), out_write.as_fd())
                    .unwrap()
                    .drain_on_cancel(true),
            )
            .link(
                RelayLink::new("down err", err_read.as_fd(), errout_write.as_fd())
                    .unwrap()
                    .drain_on_cancel(true),
            )
            .start()
            .unwrap();
        drop(out_write);
        drop(errout_write);

        let mut up_write = File::from(up_write);
        up_write.write_all(b"ping\n").unwrap();

        // The slave echoes and receives the line
        let mut slave_in = slave.try_clone().unwrap();
        let mut line = [0u8; 5];
        slave_in.read_exact(&mut line).unwrap();
        assert_eq!(&line, b"ping\n");

        let mut err_write = File::from(err_write);
        err_write.write_all(b"warning\n").unwrap();
        drop(err_write);

        // The error pipe closing is the first completion
        let first = relay.await_any_completion();
        assert_eq!(first.label, "down err");
        assert_eq!(first.outcome, LinkOutcome::Eof);

        drop(slave);
        drop(slave_in);
        let report = relay.shutdown();
        assert_eq!(report.link("up").unwrap().outcome, LinkOutcome::Cancelled);
        assert_eq!(report.link("up").unwrap().bytes, 5);
        assert_eq!(report.link("down err").unwrap().bytes, 8);

        let mut errors = String::new();
        File::from(errout_read).read_to_string(&mut errors).unwrap();
        assert_eq!(errors, "warning\n");

        let mut output = String::new();
        File::from(out_read).read_to_string(&mut output).unwrap();
        assert!(output.contains("ping"));
    }

    fn shutdown_within(relay: RunningRelay, limit: Duration) -> RelayReport {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(relay.shutdown());
        });
        rx.recv_timeout(limit).expect("relay shutdown did not finish")
    }

    #[test]
    fn test_cancel_up_link_stuck_on_unread_terminal() {
        // The slave side stays open but nothing ever reads it
        let pty = Pty::open().expect("Failed to create PTY");
        let _slave = pty.open_slave().unwrap();
        let (up_read, up_write) = pipe().unwrap();

        let relay = RelayEngine::new()
            .link(
                RelayLink::new("up", up_read.as_fd(), pty.master())
                    .unwrap()
                    .transfer_mode(TransferMode::Copy)
                    .nonblocking_output(true),
            )
            .start()
            .unwrap();
        drop(up_read);

        // Types until the link's end of the pipe goes away
        let typist = thread::spawn(move || {
            let mut up_write = File::from(up_write);
            let lines = b"y\n".repeat(512);
            while up_write.write_all(&lines).is_ok() {}
        });

        thread::sleep(Duration::from_millis(200));
        assert!(relay.latch().first().is_none());

        let report = shutdown_within(relay, Duration::from_secs(5));
        let up = report.link("up").unwrap();
        assert_eq!(up.outcome, LinkOutcome::Cancelled);
        assert!(up.bytes > 0);
        typist.join().unwrap();
    }
}
