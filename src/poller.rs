//! Readiness waiting over heterogeneous descriptors (serial line, sockets, stdin).

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

/// Stand-in when `now + limit` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Wait up to `timeout` for any of `fds` to become readable.
///
/// Returns one flag per descriptor, in order. Hang-up and error conditions
/// count as readable so the following read observes EOF or the error.
/// A signal interrupting the wait yields all-false.
pub fn wait_readable(fds: &[BorrowedFd<'_>], timeout: Duration) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    match poll(&mut pollfds, PollTimeout::from(millis)) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![false; fds.len()]),
        Err(e) => return Err(io::Error::from(e)),
    }
    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(pollfds
        .iter()
        .map(|p| p.revents().map_or(false, |r| r.intersects(ready)))
        .collect())
}

/// Zero-timeout readability check for a single descriptor.
pub fn is_readable(fd: BorrowedFd<'_>) -> io::Result<bool> {
    Ok(wait_readable(&[fd], Duration::ZERO)?[0])
}

/// `Instant::now() + limit`, saturating instead of panicking on overflow.
pub fn deadline_after(limit: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(limit)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
